use super::JobPhase;
use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// The closed set of pipeline task types
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
    EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskKind {
    Ingest,
    Discover,
    ParseBatch,
    Merge,
    Map,
    Summarize,
    Finalize,
}

impl TaskKind {
    pub fn lane(self) -> Lane {
        match self {
            TaskKind::Ingest | TaskKind::Finalize => Lane::High,
            TaskKind::Discover | TaskKind::ParseBatch | TaskKind::Merge | TaskKind::Map => {
                Lane::Normal
            }
            TaskKind::Summarize => Lane::Low,
        }
    }

    /// Phase the job is in while this task runs
    pub fn phase(self) -> JobPhase {
        match self {
            TaskKind::Ingest => JobPhase::Acquiring,
            TaskKind::Discover => JobPhase::Discovering,
            TaskKind::ParseBatch | TaskKind::Merge => JobPhase::Parsing,
            TaskKind::Map => JobPhase::Mapping,
            TaskKind::Summarize | TaskKind::Finalize => JobPhase::Summarizing,
        }
    }
}

/// Priority lane, declared from most to least urgent
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
    EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Lane {
    High,
    Normal,
    Low,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::High, Lane::Normal, Lane::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A slice of the discovered file list handled by one parse task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSpec {
    pub index: usize,
    pub total: usize,
    pub files: Vec<String>,
    /// Hash of the sorted file list, stable across retries and re-discovery
    pub fingerprint: String,
}

impl BatchSpec {
    pub fn new(index: usize, total: usize, mut files: Vec<String>) -> Self {
        files.sort();
        let mut hasher = Sha256::new();
        for file in &files {
            hasher.update(file.as_bytes());
            hasher.update(b"\n");
        }
        let digest = format!("{:x}", hasher.finalize());
        Self {
            index,
            total,
            files,
            fingerprint: digest[..16].to_string(),
        }
    }

    /// Split `files` into batches of `size`; an empty list still yields one empty batch
    pub fn split(files: &[String], size: usize) -> Vec<BatchSpec> {
        let mut sorted = files.to_vec();
        sorted.sort();
        let size = size.max(1);
        if sorted.is_empty() {
            return vec![BatchSpec::new(0, 1, Vec::new())];
        }
        let chunks: Vec<Vec<String>> = sorted.chunks(size).map(|c| c.to_vec()).collect();
        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| BatchSpec::new(index, total, chunk))
            .collect()
    }
}

/// `{job_id}:{task}` or `{job_id}:parse_batch:{index}:{fingerprint}`
pub fn idempotency_key(job_id: Uuid, kind: TaskKind, batch: Option<&BatchSpec>) -> String {
    match batch {
        Some(batch) => format!("{}:{}:{}:{}", job_id, kind, batch.index, batch.fingerprint),
        None => format!("{}:{}", job_id, kind),
    }
}

/// One unit of work belonging to a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Derived from the idempotency key, so the same logical task always has the same id
    pub id: Uuid,
    pub job_id: Uuid,
    pub kind: TaskKind,
    pub batch: Option<BatchSpec>,
    pub state: TaskState,
    pub lane: Lane,
    pub idempotency_key: String,
    pub attempt: u32,
    pub error: Option<TaskError>,
    /// Handler result consumed by downstream tasks (parse batches feed merge)
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(job_id: Uuid, kind: TaskKind, batch: Option<BatchSpec>) -> Self {
        let key = idempotency_key(job_id, kind, batch.as_ref());
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
            job_id,
            kind,
            batch,
            state: TaskState::Pending,
            lane: kind.lane(),
            idempotency_key: key,
            attempt: 0,
            error: None,
            output: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn start(&mut self) {
        self.state = TaskState::Running;
        self.attempt += 1;
        self.started_at = Some(Utc::now());
        self.ended_at = None;
    }

    pub fn succeed(&mut self, output: serde_json::Value) {
        self.state = TaskState::Succeeded;
        self.output = Some(output);
        self.error = None;
        self.ended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: TaskError) {
        self.state = TaskState::Failed;
        self.error = Some(error);
        self.ended_at = Some(Utc::now());
    }

    /// Identifier used when reporting failed batches
    pub fn label(&self) -> String {
        match &self.batch {
            Some(batch) => format!("{}#{}", self.kind, batch.index),
            None => self.kind.to_string(),
        }
    }

    pub fn envelope(&self) -> TaskEnvelope {
        TaskEnvelope {
            task_id: self.id,
            job_id: self.job_id,
            kind: self.kind,
            lane: self.lane,
        }
    }
}

/// What travels through the queue; the ledger holds the rest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Uuid,
    pub job_id: Uuid,
    pub kind: TaskKind,
    pub lane: Lane,
}
