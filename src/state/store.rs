use crate::error::{AppError, Result};
use crate::models::{Event, EventPayload, Job, Snapshot, Task};
use crate::state::{JobMutation, Ledger};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory ledger (for development and testing)
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    snapshots: Arc<DashMap<String, Snapshot>>,
    jobs: Arc<DashMap<Uuid, Job>>,
    tasks: Arc<DashMap<Uuid, Task>>,
    tasks_by_job: Arc<DashMap<Uuid, Vec<Uuid>>>,
    events: Arc<DashMap<Uuid, Vec<Event>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_snapshot_if_absent(&self, snapshot: Snapshot) -> Result<(Snapshot, bool)> {
        match self.snapshots.entry(snapshot.content_hash.clone()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                tracing::debug!(snapshot_id = %snapshot.id, repo_id = %snapshot.repo_id, "Snapshot created");
                slot.insert(snapshot.clone());
                Ok((snapshot, true))
            }
        }
    }

    async fn get_snapshot(&self, content_hash: &str) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.get(content_hash).map(|entry| entry.clone()))
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        match self.snapshots.get_mut(&snapshot.content_hash) {
            Some(mut entry) => {
                *entry = snapshot.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Snapshot {} not found", snapshot.id))),
        }
    }

    async fn latest_snapshot_for_repo(&self, repo_id: &str) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|entry| entry.repo_id == repo_id)
            .max_by_key(|entry| entry.created_at)
            .map(|entry| entry.clone()))
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        tracing::debug!(job_id = %job.id, phase = %job.phase, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|entry| entry.clone()))
    }

    async fn modify_job(&self, id: &Uuid, mutation: JobMutation<'_>) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;

        // Mutate a copy so a failing mutation leaves the stored job untouched
        let mut job = entry.clone();
        if mutation(&mut job)? {
            *entry = job.clone();
        }
        Ok(job)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.clone()).collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn insert_task_if_absent(&self, task: &Task) -> Result<bool> {
        match self.tasks.entry(task.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                self.tasks_by_job.entry(task.job_id).or_default().push(task.id);
                Ok(true)
            }
        }
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|entry| entry.clone()))
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        if self.tasks.insert(task.id, task.clone()).is_none() {
            self.tasks_by_job.entry(task.job_id).or_default().push(task.id);
        }
        Ok(())
    }

    async fn list_tasks(&self, job_id: &Uuid) -> Result<Vec<Task>> {
        let ids = self
            .tasks_by_job
            .get(job_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|entry| entry.clone()))
            .collect())
    }

    async fn append_event(&self, job_id: &Uuid, payload: EventPayload) -> Result<Event> {
        let mut log = self.events.entry(*job_id).or_default();
        let event = Event::new(log.len() as u64 + 1, *job_id, payload);
        log.push(event.clone());
        Ok(event)
    }

    async fn events_after(&self, job_id: &Uuid, after_seq: u64) -> Result<Vec<Event>> {
        Ok(self
            .events
            .get(job_id)
            .map(|log| {
                log.iter()
                    .skip(after_seq as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
