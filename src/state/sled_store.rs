use crate::error::{AppError, Result};
use crate::models::{Event, EventPayload, Job, Snapshot, Task};
use crate::state::{JobMutation, Ledger};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Persistent ledger using the Sled embedded database
///
/// Records are stored as JSON. Task and event keys are prefixed with the job id
/// so a prefix scan returns one job's rows in key order.
#[derive(Clone)]
pub struct SledLedger {
    db: Arc<Db>,
    snapshots: sled::Tree,
    jobs: sled::Tree,
    tasks: sled::Tree,
    job_tasks: sled::Tree,
    events: sled::Tree,
    event_seq: sled::Tree,
}

impl SledLedger {
    /// Open (or create) a ledger at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            AppError::Infrastructure(format!("Failed to open Sled database: {}", e))
        })?;

        let ledger = Self {
            snapshots: db.open_tree("snapshots")?,
            jobs: db.open_tree("jobs")?,
            tasks: db.open_tree("tasks")?,
            job_tasks: db.open_tree("job_tasks")?,
            events: db.open_tree("events")?,
            event_seq: db.open_tree("event_seq")?,
            db: Arc::new(db),
        };

        tracing::info!(path = ?path.as_ref(), "Initialized Sled ledger");
        Ok(ledger)
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| {
            AppError::Serialization(format!("Failed to encode ledger record: {}", e))
        })
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| {
            AppError::Serialization(format!("Failed to decode ledger record: {}", e))
        })
    }

    fn job_task_key(job_id: &Uuid, created_ms: i64, task_id: &Uuid) -> Vec<u8> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(job_id.as_bytes());
        key.extend_from_slice(&created_ms.to_be_bytes());
        key.extend_from_slice(task_id.as_bytes());
        key
    }

    fn event_key(job_id: &Uuid, seq: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(job_id.as_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Get database size in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

#[async_trait]
impl Ledger for SledLedger {
    async fn create_snapshot_if_absent(&self, snapshot: Snapshot) -> Result<(Snapshot, bool)> {
        let key = snapshot.content_hash.as_bytes();
        let encoded = Self::encode(&snapshot)?;

        match self
            .snapshots
            .compare_and_swap(key, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => {
                self.flush().await?;
                tracing::debug!(snapshot_id = %snapshot.id, repo_id = %snapshot.repo_id, "Snapshot created");
                Ok((snapshot, true))
            }
            Err(conflict) => {
                let current = conflict.current.ok_or_else(|| {
                    AppError::Internal("Snapshot CAS conflict without a current value".into())
                })?;
                Ok((Self::decode(&current)?, false))
            }
        }
    }

    async fn get_snapshot(&self, content_hash: &str) -> Result<Option<Snapshot>> {
        self.snapshots
            .get(content_hash.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let key = snapshot.content_hash.as_bytes();
        if !self.snapshots.contains_key(key)? {
            return Err(AppError::NotFound(format!("Snapshot {} not found", snapshot.id)));
        }
        self.snapshots.insert(key, Self::encode(snapshot)?)?;
        self.flush().await
    }

    async fn latest_snapshot_for_repo(&self, repo_id: &str) -> Result<Option<Snapshot>> {
        let mut latest: Option<Snapshot> = None;
        for item in self.snapshots.iter() {
            let (_, bytes) = item?;
            let snapshot: Snapshot = Self::decode(&bytes)?;
            if snapshot.repo_id != repo_id {
                continue;
            }
            if latest
                .as_ref()
                .map_or(true, |current| snapshot.created_at > current.created_at)
            {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.as_bytes(), Self::encode(job)?)?;
        self.flush().await?;
        tracing::debug!(job_id = %job.id, phase = %job.phase, "Job saved");
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        self.jobs
            .get(id.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn modify_job(&self, id: &Uuid, mutation: JobMutation<'_>) -> Result<Job> {
        loop {
            let current = self
                .jobs
                .get(id.as_bytes())?
                .ok_or_else(|| AppError::NotFound(format!("Job {} not found", id)))?;
            let mut job: Job = Self::decode(&current)?;
            if !mutation(&mut job)? {
                return Ok(job);
            }

            let encoded = Self::encode(&job)?;
            match self
                .jobs
                .compare_and_swap(id.as_bytes(), Some(current), Some(encoded))?
            {
                Ok(()) => {
                    self.flush().await?;
                    return Ok(job);
                }
                // Lost a race with another writer; re-read and re-apply
                Err(_) => continue,
            }
        }
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, bytes) = item?;
            jobs.push(Self::decode::<Job>(&bytes)?);
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn insert_task_if_absent(&self, task: &Task) -> Result<bool> {
        let inserted = self
            .tasks
            .compare_and_swap(
                task.id.as_bytes(),
                None as Option<&[u8]>,
                Some(Self::encode(task)?),
            )?
            .is_ok();

        if inserted {
            let index_key =
                Self::job_task_key(&task.job_id, task.created_at.timestamp_millis(), &task.id);
            self.job_tasks.insert(index_key, task.id.as_bytes().to_vec())?;
            self.flush().await?;
        }
        Ok(inserted)
    }

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>> {
        self.tasks
            .get(id.as_bytes())?
            .map(|bytes| Self::decode(&bytes))
            .transpose()
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let previous = self.tasks.insert(task.id.as_bytes(), Self::encode(task)?)?;
        if previous.is_none() {
            let index_key =
                Self::job_task_key(&task.job_id, task.created_at.timestamp_millis(), &task.id);
            self.job_tasks.insert(index_key, task.id.as_bytes().to_vec())?;
        }
        self.flush().await
    }

    async fn list_tasks(&self, job_id: &Uuid) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for item in self.job_tasks.scan_prefix(job_id.as_bytes()) {
            let (_, task_id) = item?;
            if let Some(bytes) = self.tasks.get(&task_id)? {
                tasks.push(Self::decode::<Task>(&bytes)?);
            }
        }
        Ok(tasks)
    }

    async fn append_event(&self, job_id: &Uuid, payload: EventPayload) -> Result<Event> {
        let seq_key: &[u8] = job_id.as_bytes();
        // Counter bump and event row commit together so a crash cannot skip a seq
        let event = (&self.event_seq, &self.events)
            .transaction(|(seqs, events)| {
                let next = seqs
                    .get(seq_key)?
                    .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_ref()).ok())
                    .map(u64::from_be_bytes)
                    .unwrap_or(0)
                    + 1;
                let event = Event::new(next, *job_id, payload.clone());
                let encoded = Self::encode(&event).map_err(ConflictableTransactionError::Abort)?;
                seqs.insert(seq_key, next.to_be_bytes().to_vec())?;
                events.insert(Self::event_key(job_id, next), encoded)?;
                Ok(event)
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => AppError::from(e),
            })?;
        self.flush().await?;
        Ok(event)
    }

    async fn events_after(&self, job_id: &Uuid, after_seq: u64) -> Result<Vec<Event>> {
        let start = Self::event_key(job_id, after_seq.saturating_add(1));
        let end = Self::event_key(job_id, u64::MAX);
        let mut events = Vec::new();
        for item in self.events.range(start..=end) {
            let (_, bytes) = item?;
            events.push(Self::decode::<Event>(&bytes)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPhase, SnapshotStatus, TaskKind, TaskState};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sled_ledger_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let job = Job::new("repo", "snap", "settings");
        {
            let ledger = SledLedger::new(temp_dir.path()).unwrap();
            ledger.save_job(&job).await.unwrap();
            ledger
                .append_event(
                    &job.id,
                    EventPayload::Phase {
                        phase: JobPhase::Queued,
                        pct: 0,
                    },
                )
                .await
                .unwrap();
        }

        let ledger = SledLedger::new(temp_dir.path()).unwrap();
        assert!(ledger.get_job(&job.id).await.unwrap().is_some());
        let event = ledger
            .append_event(&job.id, EventPayload::Progress { pct: 5, message: None })
            .await
            .unwrap();
        assert_eq!(event.seq, 2);
    }

    #[tokio::test]
    async fn test_sled_snapshot_cas() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = SledLedger::new(temp_dir.path()).unwrap();

        let (first, created) = ledger
            .create_snapshot_if_absent(Snapshot::new("0123456789abcdef0123", 1, 1))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = ledger
            .create_snapshot_if_absent(Snapshot::new("0123456789abcdef0123", 1, 1))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.repo_id, second.repo_id);

        let mut ready = second.clone();
        ready.status = SnapshotStatus::Ready;
        ledger.update_snapshot(&ready).await.unwrap();
        let latest = ledger
            .latest_snapshot_for_repo(&first.repo_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, SnapshotStatus::Ready);
    }

    #[tokio::test]
    async fn test_sled_tasks_listed_per_job() {
        let temp_dir = TempDir::new().unwrap();
        let ledger = SledLedger::new(temp_dir.path()).unwrap();
        let job_id = Uuid::new_v4();

        let mut ingest = Task::new(job_id, TaskKind::Ingest, None);
        assert!(ledger.insert_task_if_absent(&ingest).await.unwrap());
        assert!(!ledger.insert_task_if_absent(&ingest).await.unwrap());
        ledger
            .insert_task_if_absent(&Task::new(Uuid::new_v4(), TaskKind::Ingest, None))
            .await
            .unwrap();

        ingest.start();
        ingest.succeed(serde_json::json!({"ok": true}));
        ledger.save_task(&ingest).await.unwrap();

        let tasks = ledger.list_tasks(&job_id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].state, TaskState::Succeeded);
    }

    #[tokio::test]
    async fn test_event_counter_tracks_stored_events() {
        let temp_dir = TempDir::new().unwrap();
        let job_id = Uuid::new_v4();
        {
            let ledger = SledLedger::new(temp_dir.path()).unwrap();
            let mut handles = Vec::new();
            for pct in 0..16u8 {
                let ledger = ledger.clone();
                handles.push(tokio::spawn(async move {
                    ledger
                        .append_event(&job_id, EventPayload::Progress { pct, message: None })
                        .await
                        .unwrap()
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let counter = ledger.event_seq.get(job_id.as_bytes()).unwrap().unwrap();
            assert_eq!(u64::from_be_bytes(<[u8; 8]>::try_from(counter.as_ref()).unwrap()), 16);
            let seqs: Vec<u64> = ledger
                .events_after(&job_id, 0)
                .await
                .unwrap()
                .iter()
                .map(|e| e.seq)
                .collect();
            assert_eq!(seqs, (1..=16).collect::<Vec<_>>());
        }

        let ledger = SledLedger::new(temp_dir.path()).unwrap();
        let next = ledger
            .append_event(&job_id, EventPayload::Progress { pct: 99, message: None })
            .await
            .unwrap();
        assert_eq!(next.seq, 17);
    }
}
