//! Append-only, versioned storage for pipeline outputs.

pub mod fs_store;
pub mod layout;
pub mod memory;

pub use fs_store::FsArtifactStore;
pub use memory::InMemoryArtifactStore;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AppError, Result};
use crate::metrics::{ARTIFACTS_WRITTEN_TOTAL, ARTIFACT_BYTES};
use crate::models::{ArtifactKey, ArtifactRecord, ArtifactSummary};
use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Schema version stamped on every artifact written by this build
pub const SCHEMA_VERSION: u32 = 1;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `payload` as the next version of `key`.
    ///
    /// When `idempotency_key` matches the key of the latest version, that
    /// version is returned instead of writing a new one.
    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<ArtifactRecord>;

    /// Metadata of the highest version, if any
    async fn latest_record(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>>;

    async fn get_version(&self, key: &ArtifactKey, version: u32) -> Result<(ArtifactRecord, Vec<u8>)>;

    /// Every kind and version stored for a snapshot, across settings hashes
    async fn list(&self, repo_id: &str, commit_hash: &str) -> Result<Vec<ArtifactSummary>>;

    async fn get_latest(&self, key: &ArtifactKey) -> Result<(ArtifactRecord, Vec<u8>)> {
        let record = self.latest_record(key).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "No {} artifact for repo {} snapshot {}",
                key.kind, key.repo_id, key.commit_hash
            ))
        })?;
        self.get_version(key, record.version).await
    }
}

/// Serialize `value` and store it as the next version
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
    value: &T,
    idempotency_key: Option<&str>,
) -> Result<ArtifactRecord> {
    let payload = serde_json::to_vec_pretty(value)?;
    store.put_artifact(key, payload, idempotency_key).await
}

/// Fetch and deserialize the latest version
pub async fn get_latest_json<T: DeserializeOwned>(
    store: &dyn ArtifactStore,
    key: &ArtifactKey,
) -> Result<(ArtifactRecord, T)> {
    let (record, bytes) = store.get_latest(key).await?;
    Ok((record, serde_json::from_slice(&bytes)?))
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// True when `latest` was written by the same logical task, so a retried write maps onto it
pub(crate) fn is_replay(latest: &ArtifactRecord, idempotency_key: Option<&str>) -> bool {
    match (idempotency_key, latest.idempotency_key.as_deref()) {
        (Some(incoming), Some(stored)) => incoming == stored,
        _ => false,
    }
}

pub(crate) fn new_record(
    key: &ArtifactKey,
    version: u32,
    payload: &[u8],
    idempotency_key: Option<&str>,
) -> ArtifactRecord {
    ArtifactRecord {
        kind: key.kind,
        version,
        uri: layout::payload_path(key, version),
        bytes: payload.len() as u64,
        sha256: sha256_hex(payload),
        idempotency_key: idempotency_key.map(str::to_string),
        schema_version: SCHEMA_VERSION,
        generator_version: env!("CARGO_PKG_VERSION").to_string(),
        created_at: Utc::now(),
    }
}

pub(crate) fn record_written(record: &ArtifactRecord) {
    let kind = record.kind.to_string();
    ARTIFACTS_WRITTEN_TOTAL.with_label_values(&[&kind]).inc();
    ARTIFACT_BYTES
        .with_label_values(&[&kind])
        .observe(record.bytes as f64);
    tracing::debug!(kind = %kind, version = record.version, bytes = record.bytes, uri = %record.uri, "Artifact written");
}

/// Create an artifact store based on configuration
pub fn create_artifact_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    match config.backend {
        StorageBackend::Fs => {
            let root = config.artifact_root();
            tracing::info!(root = ?root, "Initializing filesystem artifact store");
            Ok(Arc::new(FsArtifactStore::new(root)?))
        }
        StorageBackend::Memory => {
            tracing::info!("Initializing in-memory artifact store");
            Ok(Arc::new(InMemoryArtifactStore::new()))
        }
    }
}
