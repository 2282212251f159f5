//! Job lifecycle: submission, phase advance, fan-out and gating, failure,
//! cancellation and crash recovery.
//!
//! State changes and the events describing them happen under a per-job lock,
//! so the event log of a job follows its ledger row and nothing is published
//! after a terminal event.

use super::context::PipelineContext;
use crate::analysis::AnalysisWarning;
use crate::error::{AppError, Result, TaskError, TaskErrorKind};
use crate::ingest::{store_upload, upload_path, zip_guard::ZipManifest};
use crate::metrics::helpers::record_job_finished;
use crate::metrics::{CACHE_HITS_TOTAL, JOBS_TOTAL, UPLOADS_REJECTED_TOTAL};
use crate::models::{
    ArtifactKind, ArtifactRecord, BatchSpec, Event, EventPayload, Job, JobPhase, Snapshot,
    SnapshotStatus, Task, TaskKind, TaskState,
};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CODE_CANCELLED: &str = "cancelled";

/// Response body of a successful upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub repo_id: String,
    pub job_id: Uuid,
    #[serde(skip)]
    pub snapshot_id: String,
    #[serde(skip)]
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub jobs_resumed: usize,
    pub tasks_requeued: usize,
}

/// Percentage reported when a task starts
pub fn start_pct(kind: TaskKind) -> u8 {
    match kind {
        TaskKind::Ingest => 5,
        TaskKind::Discover => 15,
        TaskKind::ParseBatch => 35,
        TaskKind::Merge => 50,
        TaskKind::Map => 60,
        TaskKind::Summarize => 80,
        TaskKind::Finalize => 95,
    }
}

/// Percentage reported when a task completes
pub fn end_pct(kind: TaskKind) -> u8 {
    match kind {
        TaskKind::Ingest => 5,
        TaskKind::Discover => 25,
        TaskKind::ParseBatch => 50,
        TaskKind::Merge => 55,
        TaskKind::Map => 75,
        TaskKind::Summarize => 95,
        TaskKind::Finalize => 100,
    }
}

/// 35 → 50 as parse batches complete
pub fn parse_pct(done: usize, total: usize) -> u8 {
    let total = total.max(1);
    let span = (end_pct(TaskKind::ParseBatch) - start_pct(TaskKind::ParseBatch)) as usize;
    start_pct(TaskKind::ParseBatch) + (span * done.min(total) / total) as u8
}

/// Parse batches of a job that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchGate {
    total: usize,
    succeeded: usize,
    failed: Vec<String>,
}

impl BatchGate {
    fn settled(&self) -> bool {
        self.succeeded + self.failed.len() >= self.total
    }
}

pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
    job_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            job_locks: DashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    fn job_lock(&self, job_id: Uuid) -> Arc<Mutex<()>> {
        self.job_locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Unlock and forget the lock of a job that has ended
    fn release(&self, job_id: &Uuid, guard: MutexGuard<'_, ()>) {
        drop(guard);
        self.job_locks.remove(job_id);
    }

    async fn load_job(&self, job_id: &Uuid) -> Result<Job> {
        self.ctx
            .ledger
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
    }

    /// Validate an upload, record its snapshot and job, and enqueue the first task.
    ///
    /// Everything that can reject the upload runs before anything is stored.
    pub async fn submit_job(&self, bytes: Vec<u8>) -> Result<Submission> {
        let guard = self.ctx.guard.clone();
        let (manifest, bytes): (ZipManifest, Vec<u8>) =
            tokio::task::spawn_blocking(move || guard.inspect(&bytes).map(|m| (m, bytes)))
                .await
                .map_err(|e| AppError::Internal(format!("zip inspection panicked: {}", e)))?
                .inspect_err(|e| {
                    UPLOADS_REJECTED_TOTAL
                        .with_label_values(&[e.error_code()])
                        .inc();
                })?;

        let candidate = Snapshot::new(
            &manifest.content_hash,
            manifest.file_count(),
            manifest.total_bytes,
        );
        let (snapshot, created) = self.ctx.ledger.create_snapshot_if_absent(candidate).await?;
        let cache_hit = !created && snapshot.status == SnapshotStatus::Ready;

        let mut job = Job::new(&snapshot.repo_id, &snapshot.id, &self.ctx.settings_hash);
        job.cache_hit = cache_hit;
        self.ctx.ledger.save_job(&job).await?;
        self.ctx.bus.overlay().track(&job);
        JOBS_TOTAL.with_label_values(&["submitted"]).inc();

        info!(
            job_id = %job.id,
            repo_id = %job.repo_id,
            snapshot_id = %snapshot.id,
            files = manifest.file_count(),
            bytes = manifest.total_bytes,
            cache_hit,
            "Job submitted"
        );

        if cache_hit {
            CACHE_HITS_TOTAL.inc();
            self.emit(
                job.id,
                EventPayload::CacheHit {
                    snapshot_id: snapshot.id.clone(),
                    commit_hash: snapshot.commit_hash().to_string(),
                },
            )
            .await?;

            let metrics_key = self.ctx.artifact_key(&job, ArtifactKind::Metrics);
            if self.ctx.artifacts.latest_record(&metrics_key).await?.is_some() {
                debug!(job_id = %job.id, "Analysis already complete for snapshot, finalizing");
                self.enqueue_task(job.id, TaskKind::Finalize, None).await?;
            } else {
                self.enqueue_task(job.id, TaskKind::Discover, None).await?;
            }
        } else {
            store_upload(&self.ctx.uploads_dir(), &job.id, &bytes).await?;
            self.enqueue_task(job.id, TaskKind::Ingest, None).await?;
        }

        Ok(Submission {
            repo_id: job.repo_id,
            job_id: job.id,
            snapshot_id: snapshot.id,
            cache_hit,
        })
    }

    /// Record a task and put it on the queue unless it already exists
    pub async fn enqueue_task(&self, job_id: Uuid, kind: TaskKind, batch: Option<BatchSpec>) -> Result<bool> {
        let task = Task::new(job_id, kind, batch);
        let inserted = self.ctx.ledger.insert_task_if_absent(&task).await?;
        if inserted {
            self.ctx.queue.enqueue(task.envelope()).await?;
            debug!(
                job_id = %job_id,
                task = %kind,
                key = %task.idempotency_key,
                lane = %task.lane,
                "Task enqueued"
            );
        } else {
            debug!(job_id = %job_id, key = %task.idempotency_key, "Task already recorded");
        }
        Ok(inserted)
    }

    /// Publish an event unless the job has already ended
    pub async fn emit(&self, job_id: Uuid, payload: EventPayload) -> Result<Option<Event>> {
        if self.load_job(&job_id).await?.is_terminal() {
            return Ok(None);
        }
        let lock = self.job_lock(job_id);
        let guard = lock.lock().await;
        // Ended while we waited
        if self.load_job(&job_id).await?.is_terminal() {
            self.release(&job_id, guard);
            return Ok(None);
        }
        Ok(Some(self.ctx.bus.publish(job_id, payload).await?))
    }

    pub async fn warn(&self, job_id: Uuid, warning: AnalysisWarning) -> Result<()> {
        self.emit(
            job_id,
            EventPayload::Warning {
                code: warning.code,
                message: warning.message,
                file: warning.file,
            },
        )
        .await?;
        Ok(())
    }

    pub async fn artifact_ready(&self, job_id: Uuid, record: &ArtifactRecord) -> Result<()> {
        self.emit(
            job_id,
            EventPayload::ArtifactReady {
                kind: record.kind,
                version: record.version,
                uri: record.uri.clone(),
                bytes: record.bytes,
            },
        )
        .await?;
        Ok(())
    }

    /// Move a job forward and publish `phase` (or `progress` within a phase).
    /// Returns false when nothing changed or the job already ended.
    pub async fn advance(&self, job_id: Uuid, phase: JobPhase, pct: u8) -> Result<bool> {
        let lock = self.job_lock(job_id);
        let guard = lock.lock().await;

        let mut before = JobPhase::Queued;
        let mut changed = false;
        let result = self
            .ctx
            .ledger
            .modify_job(&job_id, &mut |job: &mut Job| {
                before = job.phase;
                changed = job.advance(phase, pct)?;
                Ok(changed)
            })
            .await;

        let job = match result {
            Ok(job) => job,
            Err(AppError::InvalidStateTransition(_)) => {
                self.release(&job_id, guard);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if !changed {
            if job.is_terminal() {
                self.release(&job_id, guard);
            }
            return Ok(false);
        }

        let payload = if job.phase != before {
            EventPayload::Phase {
                phase: job.phase,
                pct: job.pct,
            }
        } else {
            EventPayload::Progress {
                pct: job.pct,
                message: None,
            }
        };
        self.ctx.bus.publish(job_id, payload).await?;
        Ok(true)
    }

    /// Enter the phase of a task that is about to run
    pub async fn on_task_started(&self, task: &Task) -> Result<()> {
        self.advance(task.job_id, task.kind.phase(), start_pct(task.kind))
            .await?;
        Ok(())
    }

    /// Enqueue whatever follows a succeeded task
    pub async fn on_task_succeeded(&self, task: &Task) -> Result<()> {
        let job = self.load_job(&task.job_id).await?;
        if job.is_terminal() {
            debug!(job_id = %job.id, task = %task.kind, "Job already ended, not advancing");
            return Ok(());
        }
        if job.cancel_requested {
            return self.fail_cancelled(job.id).await;
        }

        match task.kind {
            TaskKind::Ingest => {
                self.enqueue_task(job.id, TaskKind::Discover, None).await?;
            }
            TaskKind::Discover => {
                self.advance(job.id, JobPhase::Discovering, end_pct(TaskKind::Discover))
                    .await?;
                let paths: Vec<String> = task
                    .output
                    .as_ref()
                    .and_then(|o| o.get("paths"))
                    .map(|p| serde_json::from_value(p.clone()))
                    .transpose()?
                    .unwrap_or_default();
                let batches = BatchSpec::split(&paths, self.ctx.config.analysis.parse_batch_size);
                info!(job_id = %job.id, files = paths.len(), batches = batches.len(), "Fanning out parse batches");
                for batch in batches {
                    self.enqueue_task(job.id, TaskKind::ParseBatch, Some(batch)).await?;
                }
            }
            TaskKind::ParseBatch => self.on_batch_succeeded(&job, task).await?,
            TaskKind::Merge => {
                self.advance(job.id, JobPhase::Parsing, end_pct(TaskKind::Merge))
                    .await?;
                self.enqueue_task(job.id, TaskKind::Map, None).await?;
            }
            TaskKind::Map => {
                self.advance(job.id, JobPhase::Mapping, end_pct(TaskKind::Map))
                    .await?;
                self.enqueue_task(job.id, TaskKind::Summarize, None).await?;
            }
            TaskKind::Summarize => {
                self.advance(job.id, JobPhase::Summarizing, end_pct(TaskKind::Summarize))
                    .await?;
                self.enqueue_task(job.id, TaskKind::Finalize, None).await?;
            }
            TaskKind::Finalize => {
                let metrics = task.output.clone().unwrap_or_else(|| json!({}));
                self.finish_job(job.id, metrics).await?;
            }
        }
        Ok(())
    }

    /// Settle state of the parse batches of a job
    async fn batch_gate(&self, job_id: &Uuid, total: usize) -> Result<BatchGate> {
        let mut succeeded = BTreeSet::new();
        let mut failed = BTreeMap::new();
        for task in self.ctx.ledger.list_tasks(job_id).await? {
            if task.kind != TaskKind::ParseBatch {
                continue;
            }
            let index = task.batch.as_ref().map(|b| b.index).unwrap_or(0);
            match task.state {
                TaskState::Succeeded => {
                    succeeded.insert(index);
                }
                TaskState::Failed => {
                    failed.insert(index, task.idempotency_key);
                }
                _ => {}
            }
        }
        Ok(BatchGate {
            total: total.max(1),
            succeeded: succeeded.len(),
            failed: failed.into_values().collect(),
        })
    }

    /// Report batch progress and close the gate once every batch has settled
    async fn on_batch_succeeded(&self, job: &Job, task: &Task) -> Result<()> {
        let total = task.batch.as_ref().map(|b| b.total).unwrap_or(1);
        let gate = self.batch_gate(&job.id, total).await?;

        self.advance(job.id, JobPhase::Parsing, parse_pct(gate.succeeded, gate.total))
            .await?;
        self.close_batch_gate(job.id, &gate, None).await
    }

    /// Merge when every batch succeeded, fail with every failed batch once all settled
    async fn close_batch_gate(
        &self,
        job_id: Uuid,
        gate: &BatchGate,
        cause: Option<&TaskError>,
    ) -> Result<()> {
        if !gate.settled() {
            if !gate.failed.is_empty() {
                debug!(
                    job_id = %job_id,
                    failed = gate.failed.len(),
                    settled = gate.succeeded + gate.failed.len(),
                    total = gate.total,
                    "Batch failed, waiting for the rest to settle"
                );
            }
            return Ok(());
        }

        if gate.failed.is_empty() {
            // Create-if-absent: concurrent last batches enqueue merge once
            if self.enqueue_task(job_id, TaskKind::Merge, None).await? {
                info!(job_id = %job_id, batches = gate.total, "All parse batches done, merge enqueued");
            }
            return Ok(());
        }

        let partial = TaskError::from(AppError::PartialFailure {
            failed_batches: gate.failed.clone(),
        });
        let context = json!({
            "failedBatches": gate.failed,
            "cause": cause,
        });
        self.fail_job(job_id, &partial.code, &partial.message, context)
            .await
    }

    /// Fail the job for a task that exhausted its attempts.
    /// A failed parse batch only fails the job once its siblings have settled.
    pub async fn on_task_failed(&self, task: &Task, error: &TaskError) -> Result<()> {
        if error.kind == TaskErrorKind::Cancelled {
            return self.fail_cancelled(task.job_id).await;
        }

        if task.kind == TaskKind::ParseBatch {
            let total = task.batch.as_ref().map(|b| b.total).unwrap_or(1);
            let gate = self.batch_gate(&task.job_id, total).await?;
            return self.close_batch_gate(task.job_id, &gate, Some(error)).await;
        }

        let context = json!({
            "task": task.kind,
            "attempt": task.attempt,
            "kind": error.kind,
            "detail": error.context,
        });
        self.fail_job(task.job_id, &error.code, &error.display_message(), context)
            .await
    }

    /// Move the job to `failed` and publish the `error` event, once
    pub async fn fail_job(
        &self,
        job_id: Uuid,
        code: &str,
        message: &str,
        context: serde_json::Value,
    ) -> Result<()> {
        let lock = self.job_lock(job_id);
        let guard = lock.lock().await;

        let mut phase = JobPhase::Queued;
        let mut changed = false;
        let result = self
            .ctx
            .ledger
            .modify_job(&job_id, &mut |job: &mut Job| {
                phase = job.phase;
                changed = job.fail(code, message)?;
                Ok(changed)
            })
            .await;

        let job = match result {
            Ok(job) => job,
            Err(AppError::InvalidStateTransition(_)) => {
                self.release(&job_id, guard);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !changed {
            if job.is_terminal() {
                self.release(&job_id, guard);
            }
            return Ok(());
        }

        self.ctx
            .bus
            .publish(
                job_id,
                EventPayload::Error {
                    code: code.to_string(),
                    message: message.to_string(),
                    phase,
                    context,
                },
            )
            .await?;

        let secs = (Utc::now() - job.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        let outcome = if code == CODE_CANCELLED { "cancelled" } else { "failed" };
        record_job_finished(outcome, secs);
        error!(job_id = %job_id, code = %code, phase = %phase, message = %message, "Job failed");

        self.release(&job_id, guard);
        self.discard_upload(&job_id).await;
        Ok(())
    }

    /// Remove the stored upload of a job that will never be ingested
    async fn discard_upload(&self, job_id: &Uuid) {
        let path = upload_path(&self.ctx.uploads_dir(), job_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(job_id = %job_id, "Stored upload removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove stored upload"),
        }
    }

    async fn fail_cancelled(&self, job_id: Uuid) -> Result<()> {
        self.fail_job(
            job_id,
            CODE_CANCELLED,
            "job cancelled by request",
            serde_json::Value::Null,
        )
        .await
    }

    /// Move the job to `done` and publish the `done` event
    async fn finish_job(&self, job_id: Uuid, metrics: serde_json::Value) -> Result<()> {
        let lock = self.job_lock(job_id);
        let guard = lock.lock().await;

        let mut changed = false;
        let result = self
            .ctx
            .ledger
            .modify_job(&job_id, &mut |job: &mut Job| {
                changed = job.advance(JobPhase::Done, 100)?;
                Ok(changed)
            })
            .await;

        let job = match result {
            Ok(job) => job,
            Err(AppError::InvalidStateTransition(_)) => {
                self.release(&job_id, guard);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !changed {
            if job.is_terminal() {
                self.release(&job_id, guard);
            }
            return Ok(());
        }

        self.ctx
            .bus
            .publish(job_id, EventPayload::Done { metrics })
            .await?;

        let secs = (Utc::now() - job.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        record_job_finished("done", secs);
        info!(job_id = %job_id, repo_id = %job.repo_id, duration_secs = secs, "Job done");

        self.release(&job_id, guard);
        Ok(())
    }

    /// Whether workers should stop working on this job
    pub async fn should_stop(&self, job_id: &Uuid) -> Result<bool> {
        let job = self.load_job(job_id).await?;
        if job.is_terminal() {
            return Ok(true);
        }
        if job.cancel_requested {
            self.fail_cancelled(job.id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flag a job for cancellation; workers act on it at the next task boundary
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .ctx
            .ledger
            .modify_job(&job_id, &mut |job: &mut Job| {
                if job.is_terminal() {
                    return Err(AppError::InvalidStateTransition(format!(
                        "job {} is already {}",
                        job.id, job.phase
                    )));
                }
                let changed = !job.cancel_requested;
                job.cancel_requested = true;
                Ok(changed)
            })
            .await?;
        info!(job_id = %job_id, phase = %job.phase, "Cancellation requested");
        Ok(job)
    }

    /// Requeue unfinished work after a restart and rebuild the status overlay
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.ctx.bus.overlay().rebuild().await?;

        let mut report = RecoveryReport::default();
        for job in self.ctx.ledger.list_jobs().await? {
            if job.is_terminal() {
                continue;
            }
            report.jobs_resumed += 1;

            let tasks = self.ctx.ledger.list_tasks(&job.id).await?;
            let mut requeued = 0;
            for task in tasks
                .iter()
                .filter(|t| matches!(t.state, TaskState::Pending | TaskState::Running))
            {
                self.ctx.queue.enqueue(task.envelope()).await?;
                requeued += 1;
            }

            if requeued == 0 {
                // Crashed between a task settling and its follow-up being recorded
                let latest = tasks
                    .iter()
                    .filter(|t| matches!(t.state, TaskState::Succeeded | TaskState::Failed))
                    .max_by_key(|t| t.ended_at);
                match latest {
                    Some(task) if task.state == TaskState::Succeeded => {
                        self.on_task_succeeded(task).await?
                    }
                    Some(task) => {
                        let error = task.error.clone().unwrap_or_else(|| {
                            TaskError::new(TaskErrorKind::Internal, "task_failed", "task failed before restart")
                        });
                        self.on_task_failed(task, &error).await?
                    }
                    None if tasks.is_empty() => {
                        self.enqueue_task(job.id, TaskKind::Ingest, None).await?;
                    }
                    None => warn!(job_id = %job.id, "Job has no settled tasks, leaving as is"),
                }
            }

            info!(job_id = %job.id, phase = %job.phase, tasks_requeued = requeued, "Job resumed");
            report.tasks_requeued += requeued;
        }

        info!(
            jobs = report.jobs_resumed,
            tasks = report.tasks_requeued,
            "Recovery complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pct_interpolates() {
        assert_eq!(parse_pct(0, 4), 35);
        assert_eq!(parse_pct(2, 4), 42);
        assert_eq!(parse_pct(4, 4), 50);
        assert_eq!(parse_pct(9, 4), 50);
        assert_eq!(parse_pct(0, 0), 35);
    }

    #[test]
    fn test_pct_table_is_monotone_along_the_pipeline() {
        let order = [
            TaskKind::Ingest,
            TaskKind::Discover,
            TaskKind::ParseBatch,
            TaskKind::Merge,
            TaskKind::Map,
            TaskKind::Summarize,
            TaskKind::Finalize,
        ];
        for pair in order.windows(2) {
            assert!(start_pct(pair[0]) <= start_pct(pair[1]));
            assert!(end_pct(pair[0]) <= start_pct(pair[1]));
        }
    }

    #[tokio::test]
    async fn test_ended_jobs_hold_no_lock_or_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = crate::config::Config::for_testing(dir.path());
        let ctx = Arc::new(PipelineContext::from_config(config).await.unwrap());
        let orch = Orchestrator::new(ctx.clone());

        let job = Job::new("repo", "snap", "settings");
        ctx.ledger.save_job(&job).await.unwrap();
        ctx.bus.overlay().track(&job);
        assert!(orch.advance(job.id, JobPhase::Acquiring, 5).await.unwrap());
        assert_eq!(orch.job_locks.len(), 1);
        assert_eq!(ctx.bus.overlay().len(), 1);

        orch.fail_job(job.id, "boom", "exploded", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(orch.job_locks.is_empty());
        assert!(ctx.bus.overlay().is_empty());

        // Late work from in-flight tasks publishes nothing and leaves nothing behind
        let late = orch
            .emit(job.id, EventPayload::Progress { pct: 9, message: None })
            .await
            .unwrap();
        assert!(late.is_none());
        assert!(!orch.advance(job.id, JobPhase::Parsing, 40).await.unwrap());
        orch.fail_job(job.id, "boom", "again", serde_json::Value::Null)
            .await
            .unwrap();
        assert!(orch.job_locks.is_empty());
        assert!(ctx.bus.overlay().is_empty());
        assert_eq!(ctx.ledger.events_after(&job.id, 0).await.unwrap().len(), 2);
    }
}
