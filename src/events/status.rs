use crate::error::Result;
use crate::models::{Event, EventPayload, Job, JobPhase, JobStatus};
use crate::state::Ledger;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Fast read path for job status, derived from events and rebuildable from the ledger
pub struct StatusOverlay {
    statuses: DashMap<Uuid, JobStatus>,
    ledger: Arc<dyn Ledger>,
}

impl StatusOverlay {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            statuses: DashMap::new(),
            ledger,
        }
    }

    /// Seed the overlay for a job still in flight; ended jobs are served by the ledger
    pub fn track(&self, job: &Job) {
        if !job.is_terminal() {
            self.statuses.insert(job.id, job.status());
        }
    }

    /// Fold one event into the job's status. Unknown jobs are left to the ledger fallback.
    pub fn apply(&self, event: &Event) {
        let ended = match self.statuses.get_mut(&event.job_id) {
            Some(mut status) => {
                apply_payload(&mut status, &event.payload);
                status.phase.is_terminal()
            }
            None => false,
        };
        if ended {
            self.statuses.remove(&event.job_id);
        }
    }

    pub async fn get(&self, job_id: &Uuid) -> Result<Option<JobStatus>> {
        if let Some(status) = self.statuses.get(job_id) {
            return Ok(Some(status.clone()));
        }
        // Not cached: a row read here may already be stale by the time it lands
        Ok(self.ledger.get_job(job_id).await?.map(|job| job.status()))
    }

    /// Drop every cached entry and reload the unfinished jobs
    pub async fn rebuild(&self) -> Result<usize> {
        let jobs = self.ledger.list_jobs().await?;
        self.statuses.clear();
        for job in &jobs {
            self.track(job);
        }
        tracing::info!(jobs = jobs.len(), tracked = self.statuses.len(), "Status overlay rebuilt from ledger");
        Ok(self.statuses.len())
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

/// Status reached by replaying `events` from the start
pub fn fold<'a>(repo_id: &str, events: impl IntoIterator<Item = &'a Event>) -> JobStatus {
    let mut status = JobStatus::queued(repo_id);
    for event in events {
        apply_payload(&mut status, &event.payload);
    }
    status
}

fn apply_payload(status: &mut JobStatus, payload: &EventPayload) {
    match payload {
        EventPayload::Phase { phase, pct } => status.ratchet(*phase, *pct),
        EventPayload::Progress { pct, .. } => status.ratchet(status.phase, *pct),
        EventPayload::Error { message, .. } => {
            if !status.phase.is_terminal() {
                status.ratchet(JobPhase::Failed, status.pct);
                status.error = Some(message.clone());
            }
        }
        EventPayload::Done { .. } => status.ratchet(JobPhase::Done, 100),
        _ => {}
    }
}
