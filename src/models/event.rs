use super::{ArtifactKind, JobPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::AsRefStr;
use uuid::Uuid;

/// Payload of a job event. `type` on the wire is the snake_case variant name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[strum(serialize_all = "snake_case")]
pub enum EventPayload {
    Phase {
        phase: JobPhase,
        pct: u8,
    },
    Progress {
        pct: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Warning {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
    ArtifactReady {
        kind: ArtifactKind,
        version: u32,
        uri: String,
        bytes: u64,
    },
    /// Only emitted when the job moves to `failed`
    Error {
        code: String,
        message: String,
        phase: JobPhase,
        #[serde(default)]
        context: serde_json::Value,
    },
    Done {
        metrics: serde_json::Value,
    },
    CacheHit {
        snapshot_id: String,
        commit_hash: String,
    },
    FilesTotal {
        count: usize,
    },
    BatchParsed {
        batch_index: usize,
        total_batches: usize,
        parsed: usize,
        skipped: usize,
    },
    ImportsMetrics {
        total: usize,
        internal: usize,
        external: usize,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &str {
        self.as_ref()
    }

    /// No further events follow a terminal one
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Done { .. } | EventPayload::Error { .. })
    }
}

/// One ordered, immutable record in a job's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Per-job sequence number, starting at 1 with no gaps
    pub seq: u64,
    pub job_id: Uuid,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(seq: u64, job_id: Uuid, payload: EventPayload) -> Self {
        Self {
            seq,
            job_id,
            ts: Utc::now(),
            payload,
        }
    }
}
