use super::{QueueStats, TaskQueue};
use crate::error::Result;
use crate::models::{Lane, TaskEnvelope};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Lanes {
    high: VecDeque<TaskEnvelope>,
    normal: VecDeque<TaskEnvelope>,
    low: VecDeque<TaskEnvelope>,
}

impl Lanes {
    fn lane_mut(&mut self, lane: Lane) -> &mut VecDeque<TaskEnvelope> {
        match lane {
            Lane::High => &mut self.high,
            Lane::Normal => &mut self.normal,
            Lane::Low => &mut self.low,
        }
    }

    fn pop(&mut self) -> Option<TaskEnvelope> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }
}

/// In-process queue for single-node deployments and tests
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    lanes: Arc<Mutex<Lanes>>,
    notify: Arc<Notify>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        self.lanes.lock().lane_mut(envelope.lane).push_back(envelope);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent enqueue is not missed
            let notified = self.notify.notified();
            if let Some(envelope) = self.lanes.lock().pop() {
                return Ok(Some(envelope));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.lanes.lock().pop());
            }
        }
    }

    async fn ack(&self, _envelope: &TaskEnvelope) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let lanes = self.lanes.lock();
        Ok(QueueStats {
            high: lanes.high.len(),
            normal: lanes.normal.len(),
            low: lanes.low.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskKind};
    use uuid::Uuid;

    fn envelope(kind: TaskKind) -> TaskEnvelope {
        Task::new(Uuid::new_v4(), kind, None).envelope()
    }

    #[tokio::test]
    async fn test_dequeue_prefers_higher_lanes() {
        let queue = InMemoryQueue::new();
        let summarize = envelope(TaskKind::Summarize);
        let map = envelope(TaskKind::Map);
        let finalize = envelope(TaskKind::Finalize);

        queue.enqueue(summarize).await.unwrap();
        queue.enqueue(map).await.unwrap();
        queue.enqueue(finalize).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.high, stats.normal, stats.low), (1, 1, 1));

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.dequeue(timeout).await.unwrap(), Some(finalize));
        assert_eq!(queue.dequeue(timeout).await.unwrap(), Some(map));
        assert_eq!(queue.dequeue(timeout).await.unwrap(), Some(summarize));
        assert_eq!(queue.dequeue(timeout).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fifo_within_lane() {
        let queue = InMemoryQueue::new();
        let first = envelope(TaskKind::Discover);
        let second = envelope(TaskKind::Merge);
        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(queue.dequeue(timeout).await.unwrap(), Some(first));
        assert_eq!(queue.dequeue(timeout).await.unwrap(), Some(second));
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = InMemoryQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let ingest = envelope(TaskKind::Ingest);
        queue.enqueue(ingest).await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(ingest));
    }
}
