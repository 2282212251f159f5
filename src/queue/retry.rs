use crate::models::TaskKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How often a task kind is attempted and how long to wait between attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait before attempt n+1 is `backoff_secs[n-1]`; the last entry repeats
    pub backoff_secs: Vec<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_secs: &[u64]) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_secs: backoff_secs.to_vec(),
        }
    }

    /// Built-in table used when the configuration has no override
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Ingest => Self::new(3, &[30, 60, 120]),
            TaskKind::Discover => Self::new(2, &[10, 30]),
            TaskKind::ParseBatch => Self::new(3, &[60, 120, 300]),
            TaskKind::Merge => Self::new(2, &[30, 60]),
            TaskKind::Map => Self::new(2, &[30, 60]),
            TaskKind::Summarize => Self::new(3, &[120, 300, 600]),
            TaskKind::Finalize => Self::new(2, &[30, 60]),
        }
    }

    /// Whether another attempt follows a failed `attempt` (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait after failed `attempt` (1-based), multiplied by `scale`
    pub fn delay(&self, attempt: u32, scale: f64) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let secs = self
            .backoff_secs
            .get(index)
            .or_else(|| self.backoff_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs_f64(secs as f64 * scale.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_table() {
        let parse = RetryPolicy::for_kind(TaskKind::ParseBatch);
        assert_eq!(parse.max_attempts, 3);
        assert_eq!(parse.backoff_secs, vec![60, 120, 300]);

        let discover = RetryPolicy::for_kind(TaskKind::Discover);
        assert_eq!(discover.max_attempts, 2);
        assert_eq!(discover.backoff_secs, vec![10, 30]);

        assert_eq!(RetryPolicy::for_kind(TaskKind::Summarize).backoff_secs, vec![120, 300, 600]);
    }

    #[test]
    fn test_should_retry_until_max_attempts() {
        let policy = RetryPolicy::for_kind(TaskKind::Ingest);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_delay_scales_and_repeats_last() {
        let policy = RetryPolicy::new(5, &[10, 30]);
        assert_eq!(policy.delay(1, 1.0), Duration::from_secs(10));
        assert_eq!(policy.delay(2, 1.0), Duration::from_secs(30));
        assert_eq!(policy.delay(4, 1.0), Duration::from_secs(30));
        assert_eq!(policy.delay(1, 0.5), Duration::from_secs(5));
        assert_eq!(policy.delay(1, 0.0), Duration::ZERO);
    }
}
