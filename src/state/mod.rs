//! Durable job/task ledger: the source of truth for jobs, tasks, snapshots and the
//! per-job event log. Status overlays are rebuilt from here after a restart.

pub mod factory;
pub mod sled_store;
pub mod store;

pub use factory::{create_in_memory_ledger, create_ledger};
pub use sled_store::SledLedger;
pub use store::InMemoryLedger;

use crate::error::Result;
use crate::models::{Event, EventPayload, Job, Snapshot, Task};
use async_trait::async_trait;
use uuid::Uuid;

/// Mutation applied atomically to a stored job. Returns whether the job changed.
///
/// Backends may invoke it more than once when a concurrent writer wins a race,
/// so it must be free of side effects beyond the job itself.
pub type JobMutation<'a> = &'a mut (dyn FnMut(&mut Job) -> Result<bool> + Send);

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert `snapshot` unless one with the same content hash exists.
    /// Returns the stored snapshot and whether this call created it.
    async fn create_snapshot_if_absent(&self, snapshot: Snapshot) -> Result<(Snapshot, bool)>;

    async fn get_snapshot(&self, content_hash: &str) -> Result<Option<Snapshot>>;

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Most recently created snapshot owned by `repo_id`
    async fn latest_snapshot_for_repo(&self, repo_id: &str) -> Result<Option<Snapshot>>;

    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>>;

    /// Read-modify-write a job atomically and return the stored result
    async fn modify_job(&self, id: &Uuid, mutation: JobMutation<'_>) -> Result<Job>;

    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Insert `task` unless a task with the same id exists. Returns whether it was inserted.
    async fn insert_task_if_absent(&self, task: &Task) -> Result<bool>;

    async fn get_task(&self, id: &Uuid) -> Result<Option<Task>>;

    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Tasks of a job ordered by creation time
    async fn list_tasks(&self, job_id: &Uuid) -> Result<Vec<Task>>;

    /// Append an event with the next sequence number for its job
    async fn append_event(&self, job_id: &Uuid, payload: EventPayload) -> Result<Event>;

    /// Events with `seq > after_seq`, in order
    async fn events_after(&self, job_id: &Uuid, after_seq: u64) -> Result<Vec<Event>>;
}
