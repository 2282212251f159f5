/// Periodic collectors for gauges that are sampled rather than updated inline

use super::*;
use crate::models::Lane;
use crate::queue::TaskQueue;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Tracks process uptime
pub struct RuntimeCollector {
    start_time: SystemTime,
}

impl RuntimeCollector {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed().unwrap_or_default()
    }

    pub fn collect(&self) {
        UPTIME_SECONDS.set(self.uptime().as_secs_f64());
    }

    /// Spawn a background task that collects every interval
    pub fn start_periodic_collection(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                self.collect();
            }
        });
    }
}

impl Default for RuntimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples per-lane queue depth into `QUEUE_DEPTH`
pub struct QueueCollector {
    queue: Arc<dyn TaskQueue>,
}

impl QueueCollector {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }

    pub async fn collect(&self) {
        match self.queue.stats().await {
            Ok(stats) => {
                for lane in Lane::ALL {
                    QUEUE_DEPTH
                        .with_label_values(&[lane.as_ref()])
                        .set(stats.depth(lane) as f64);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to sample queue depth");
                helpers::record_error("queue_collector", "stats");
            }
        }
    }

    pub fn start_periodic_collection(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                self.collect().await;
            }
        });
    }
}

/// Helper functions for common metric operations
pub mod helpers {
    use super::*;

    pub fn record_task(task: &str, status: &str, duration_secs: f64) {
        TASKS_TOTAL.with_label_values(&[task, status]).inc();
        TASK_DURATION_SECONDS
            .with_label_values(&[task])
            .observe(duration_secs);
    }

    pub fn record_job_finished(outcome: &str, duration_secs: f64) {
        JOBS_TOTAL.with_label_values(&[outcome]).inc();
        JOB_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_file(language: &str, outcome: &str) {
        FILES_PARSED_TOTAL
            .with_label_values(&[language, outcome])
            .inc();
    }

    pub fn record_error(component: &str, error_type: &str) {
        ERRORS_TOTAL
            .with_label_values(&[component, error_type])
            .inc();
    }
}
