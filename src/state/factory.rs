use crate::config::{StateBackend, StateConfig};
use crate::error::Result;
use crate::state::{InMemoryLedger, Ledger, SledLedger};
use std::sync::Arc;

/// Create a ledger based on configuration
pub fn create_ledger(config: &StateConfig) -> Result<Arc<dyn Ledger>> {
    match config.backend {
        StateBackend::Sled => {
            tracing::info!(path = ?config.path, "Initializing Sled ledger backend");
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SledLedger::new(&config.path)?))
        }
        StateBackend::Memory => Ok(create_in_memory_ledger()),
    }
}

/// Create an in-memory ledger (for testing and development)
pub fn create_in_memory_ledger() -> Arc<dyn Ledger> {
    tracing::info!("Initializing in-memory ledger backend");
    Arc::new(InMemoryLedger::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Job;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_sled_ledger() {
        let temp_dir = TempDir::new().unwrap();
        let config = StateConfig {
            backend: StateBackend::Sled,
            path: temp_dir.path().join("ledger"),
        };

        let ledger = create_ledger(&config).unwrap();
        let job = Job::new("repo", "snap", "settings");
        ledger.save_job(&job).await.unwrap();
        assert!(ledger.get_job(&job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_memory_ledger() {
        let config = StateConfig {
            backend: StateBackend::Memory,
            path: "unused".into(),
        };
        let ledger = create_ledger(&config).unwrap();
        assert!(ledger.list_jobs().await.unwrap().is_empty());
    }
}
