use crate::error::{AppError, ResourceLimit, Result};
use crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds concurrent parser subprocesses and carries the parse timeouts
#[derive(Clone)]
pub struct SubprocessLimiter {
    permits: Arc<Semaphore>,
    concurrency: usize,
    acquire_timeout: Duration,
    pub file_timeout: Duration,
    pub batch_timeout: Duration,
}

impl SubprocessLimiter {
    pub fn new(
        concurrency: usize,
        acquire_timeout: Duration,
        file_timeout: Duration,
        batch_timeout: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            acquire_timeout,
            file_timeout,
            batch_timeout,
        }
    }

    pub fn from_config(limits: &crate::config::LimitsConfig) -> Self {
        Self::new(
            limits.node_subproc_concurrency,
            Duration::from_secs(limits.acquire_timeout_s),
            Duration::from_secs(limits.node_file_timeout_s),
            Duration::from_secs(limits.node_batch_timeout_s),
        )
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a subprocess slot, failing with `concurrency_cap` after the acquire timeout
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(AppError::Internal("subprocess semaphore closed".to_string())),
            Err(_) => {
                RATE_LIMIT_REJECTIONS_TOTAL
                    .with_label_values(&["subprocess"])
                    .inc();
                Err(AppError::exhausted(
                    ResourceLimit::ConcurrencyCap,
                    format!(
                        "no parser slot free within {:?} ({} in use)",
                        self.acquire_timeout, self.concurrency
                    ),
                ))
            }
        }
    }

    /// Run one file's work under the per-file timeout; `None` means it timed out
    pub async fn with_file_timeout<F, T>(&self, work: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        tokio::time::timeout(self.file_timeout, work).await.ok()
    }

    /// Run a whole batch under the batch timeout
    pub async fn with_batch_timeout<F, T>(&self, label: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.batch_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(AppError::exhausted(
                ResourceLimit::Timeout,
                format!("{} exceeded {:?}", label, self.batch_timeout),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(concurrency: usize) -> SubprocessLimiter {
        SubprocessLimiter::new(
            concurrency,
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_semaphore_caps_concurrency() {
        let limiter = limiter(2);
        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.available(), 0);

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ResourceExhausted {
                reason: ResourceLimit::ConcurrencyCap,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = limiter(1);
        {
            let _permit = limiter.acquire().await.unwrap();
        }
        assert!(limiter.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_file_timeout_yields_none() {
        let limiter = limiter(1);
        let slow = limiter
            .with_file_timeout(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(slow.is_none());
        assert_eq!(limiter.with_file_timeout(async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_batch_timeout_is_resource_exhausted() {
        let limiter = limiter(1);
        let err = limiter
            .with_batch_timeout("batch 0", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ResourceExhausted {
                reason: ResourceLimit::Timeout,
                ..
            }
        ));
    }
}
