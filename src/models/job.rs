use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// Lifecycle phase of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobPhase {
    Queued,
    Acquiring,
    Discovering,
    Parsing,
    Mapping,
    Summarizing,
    Done,
    Failed,
}

impl JobPhase {
    /// Position in the lifecycle; phases never move to a lower rank
    pub fn rank(self) -> u8 {
        match self {
            JobPhase::Queued => 0,
            JobPhase::Acquiring => 1,
            JobPhase::Discovering => 2,
            JobPhase::Parsing => 3,
            JobPhase::Mapping => 4,
            JobPhase::Summarizing => 5,
            JobPhase::Done => 6,
            JobPhase::Failed => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Failed)
    }

    /// Percentage reported on entering the phase
    pub fn entry_pct(self) -> u8 {
        match self {
            JobPhase::Queued => 0,
            JobPhase::Acquiring => 5,
            JobPhase::Discovering => 15,
            JobPhase::Parsing => 35,
            JobPhase::Mapping => 60,
            JobPhase::Summarizing => 80,
            JobPhase::Done => 100,
            JobPhase::Failed => 0,
        }
    }
}

/// Point-in-time view served by `GET /status/{job_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub phase: JobPhase,
    pub pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub repo_id: String,
}

impl JobStatus {
    pub fn queued(repo_id: impl Into<String>) -> Self {
        Self {
            phase: JobPhase::Queued,
            pct: 0,
            error: None,
            repo_id: repo_id.into(),
        }
    }

    /// Ratchet towards `phase`/`pct`. Leveled values make repeated application a no-op.
    pub fn ratchet(&mut self, phase: JobPhase, pct: u8) {
        if self.phase.is_terminal() {
            return;
        }
        if phase.rank() > self.phase.rank() {
            self.phase = phase;
        }
        if phase == JobPhase::Failed {
            return;
        }
        self.pct = self.pct.max(pct.min(100));
    }
}

/// When a phase was entered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub phase: JobPhase,
    pub at: DateTime<Utc>,
}

/// One user-initiated analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub repo_id: String,
    pub snapshot_id: String,
    pub settings_hash: String,
    pub phase: JobPhase,
    pub pct: u8,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub cancel_requested: bool,
    /// Set when the upload matched an existing snapshot
    pub cache_hit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub phase_marks: Vec<PhaseMark>,
}

impl Job {
    pub fn new(
        repo_id: impl Into<String>,
        snapshot_id: impl Into<String>,
        settings_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            repo_id: repo_id.into(),
            snapshot_id: snapshot_id.into(),
            settings_hash: settings_hash.into(),
            phase: JobPhase::Queued,
            pct: 0,
            error: None,
            error_code: None,
            cancel_requested: false,
            cache_hit: false,
            created_at: now,
            updated_at: now,
            phase_marks: vec![PhaseMark {
                phase: JobPhase::Queued,
                at: now,
            }],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Move forward to `phase` and raise `pct`. Returns whether anything changed.
    ///
    /// Lower-ranked phases are ignored so that late or duplicate completions
    /// cannot move a job backwards. Terminal jobs only accept their own phase.
    pub fn advance(&mut self, phase: JobPhase, pct: u8) -> Result<bool> {
        if self.is_terminal() {
            if phase == self.phase {
                return Ok(false);
            }
            return Err(AppError::InvalidStateTransition(format!(
                "job {} is {} and cannot move to {}",
                self.id, self.phase, phase
            )));
        }

        let mut changed = false;
        if phase.rank() > self.phase.rank() {
            self.phase = phase;
            self.phase_marks.push(PhaseMark {
                phase,
                at: Utc::now(),
            });
            changed = true;
        }

        let pct = if phase == JobPhase::Done { 100 } else { pct.min(100) };
        if phase != JobPhase::Failed && pct > self.pct {
            self.pct = pct;
            changed = true;
        }

        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    /// Mark the job failed with a reason code and message
    pub fn fail(&mut self, code: impl Into<String>, message: impl Into<String>) -> Result<bool> {
        let changed = self.advance(JobPhase::Failed, self.pct)?;
        if changed {
            self.error_code = Some(code.into());
            self.error = Some(message.into());
        }
        Ok(changed)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            phase: self.phase,
            pct: self.pct,
            error: self.error.clone(),
            repo_id: self.repo_id.clone(),
        }
    }

    /// Milliseconds spent in each phase, the last phase measured up to `end`
    pub fn phase_durations_ms(&self, end: DateTime<Utc>) -> BTreeMap<String, i64> {
        let mut durations = BTreeMap::new();
        for (i, mark) in self.phase_marks.iter().enumerate() {
            if mark.phase.is_terminal() {
                continue;
            }
            let until = self
                .phase_marks
                .get(i + 1)
                .map(|next| next.at)
                .unwrap_or(end);
            let ms = (until - mark.at).num_milliseconds().max(0);
            *durations.entry(mark.phase.to_string()).or_insert(0) += ms;
        }
        durations
    }
}
