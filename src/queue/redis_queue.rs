use super::{QueueStats, TaskQueue};
use crate::error::{AppError, Result};
use crate::models::{Lane, TaskEnvelope};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;

/// Redis-backed queue: one list per lane, `LPUSH` on enqueue and a single
/// `BRPOP high normal low`, which checks the keys in the given order.
#[derive(Clone)]
pub struct RedisQueue {
    client: Arc<Client>,
    connection: ConnectionManager,
    /// Blocking pops hold their connection, so they never share the manager
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
    key_prefix: String,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| AppError::Configuration(format!("Invalid Redis URL: {}", e)))?;

        let connection = ConnectionManager::new(client.clone()).await?;

        let mut test_conn = connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut test_conn)
            .await?;

        tracing::info!(prefix = %key_prefix, "Connected Redis task queue");

        Ok(Self {
            client: Arc::new(client),
            connection,
            blocking: Arc::new(Mutex::new(Vec::new())),
            key_prefix: key_prefix.to_string(),
        })
    }

    fn lane_key(&self, lane: Lane) -> String {
        format!("{}:{}", self.key_prefix, lane)
    }

    async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_tokio_connection().await?)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, envelope: TaskEnvelope) -> Result<()> {
        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.connection.clone();
        let _: () = conn.lpush(self.lane_key(envelope.lane), payload).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<TaskEnvelope>> {
        let keys: Vec<String> = Lane::ALL.iter().map(|lane| self.lane_key(*lane)).collect();
        // BRPOP takes whole seconds on older servers; 0 would block forever
        let secs = timeout.as_secs().max(1);

        let mut conn = self.blocking_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&keys)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        self.blocking.lock().push(conn);

        match popped {
            Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, _envelope: &TaskEnvelope) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.connection.clone();
        let high: usize = conn.llen(self.lane_key(Lane::High)).await?;
        let normal: usize = conn.llen(self.lane_key(Lane::Normal)).await?;
        let low: usize = conn.llen(self.lane_key(Lane::Low)).await?;
        Ok(QueueStats { high, normal, low })
    }
}
