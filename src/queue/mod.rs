//! Prioritized task queue.
//!
//! Three lanes (`high`, `normal`, `low`); `dequeue` drains a higher lane before
//! looking at a lower one and is FIFO within a lane. Only task envelopes travel
//! through the queue, the ledger holds task state.

pub mod memory;
pub mod redis_queue;
pub mod retry;

pub use memory::InMemoryQueue;
pub use redis_queue::RedisQueue;
pub use retry::RetryPolicy;

use crate::config::{QueueBackend, QueueConfig};
use crate::error::Result;
use crate::models::{Lane, TaskEnvelope};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Depth of each lane at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl QueueStats {
    pub fn depth(&self, lane: Lane) -> usize {
        match lane {
            Lane::High => self.high,
            Lane::Normal => self.normal,
            Lane::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.normal + self.low
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append to the envelope's lane
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()>;

    /// Take the next envelope in priority order, waiting up to `timeout`
    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>>;

    /// Acknowledge a dequeued envelope. Envelopes are removed on dequeue, so
    /// backends without delivery tracking treat this as a no-op.
    async fn ack(&self, envelope: &TaskEnvelope) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn len(&self) -> Result<usize> {
        Ok(self.stats().await?.total())
    }
}

/// Create a task queue based on configuration
pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn TaskQueue>> {
    match config.backend {
        QueueBackend::Memory => {
            tracing::info!("Initializing in-memory task queue");
            Ok(Arc::new(InMemoryQueue::new()))
        }
        QueueBackend::Redis => {
            tracing::info!(url = %config.redis_url, prefix = %config.key_prefix, "Initializing Redis task queue");
            Ok(Arc::new(
                RedisQueue::connect(&config.redis_url, &config.key_prefix).await?,
            ))
        }
    }
}
