use super::{is_replay, layout, new_record, record_written, ArtifactStore};
use crate::error::{AppError, Result};
use crate::models::{ArtifactKey, ArtifactRecord, ArtifactSummary};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

type Versions = Vec<(ArtifactRecord, Arc<Vec<u8>>)>;

/// In-memory artifact store (for testing and development)
#[derive(Clone, Default)]
pub struct InMemoryArtifactStore {
    versions: Arc<DashMap<ArtifactKey, Versions>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<ArtifactRecord> {
        layout::check_key(key)?;

        // The entry guard serializes version allocation per key
        let mut versions = self.versions.entry(key.clone()).or_default();
        if let Some((latest, _)) = versions.last() {
            if is_replay(latest, idempotency_key) {
                return Ok(latest.clone());
            }
        }

        let version = versions.last().map(|(r, _)| r.version + 1).unwrap_or(1);
        let record = new_record(key, version, &payload, idempotency_key);
        versions.push((record.clone(), Arc::new(payload)));
        drop(versions);

        record_written(&record);
        Ok(record)
    }

    async fn latest_record(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>> {
        Ok(self
            .versions
            .get(key)
            .and_then(|versions| versions.last().map(|(record, _)| record.clone())))
    }

    async fn get_version(&self, key: &ArtifactKey, version: u32) -> Result<(ArtifactRecord, Vec<u8>)> {
        self.versions
            .get(key)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|(record, _)| record.version == version)
                    .map(|(record, payload)| (record.clone(), payload.as_ref().clone()))
            })
            .ok_or_else(|| {
                AppError::NotFound(format!("{} not found", layout::payload_path(key, version)))
            })
    }

    async fn list(&self, repo_id: &str, commit_hash: &str) -> Result<Vec<ArtifactSummary>> {
        let mut grouped: BTreeMap<(String, crate::models::ArtifactKind), Vec<u32>> = BTreeMap::new();
        for entry in self.versions.iter() {
            let key = entry.key();
            if key.repo_id != repo_id || key.commit_hash != commit_hash {
                continue;
            }
            let versions = grouped
                .entry((key.settings_hash.clone(), key.kind))
                .or_default();
            versions.extend(entry.value().iter().map(|(record, _)| record.version));
        }

        Ok(grouped
            .into_iter()
            .map(|((settings_hash, kind), mut versions)| {
                versions.sort_unstable();
                ArtifactSummary {
                    settings_hash,
                    kind,
                    latest_version: versions.last().copied().unwrap_or(0),
                    versions,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactKind;

    #[tokio::test]
    async fn test_versions_increase_and_latest_is_highest() {
        let store = InMemoryArtifactStore::new();
        let key = ArtifactKey::new("repo", "commit", "settings", ArtifactKind::Graph);

        for n in 1..=3u32 {
            let record = store
                .put_artifact(&key, format!("{{\"n\":{}}}", n).into_bytes(), None)
                .await
                .unwrap();
            assert_eq!(record.version, n);
        }

        let (record, payload) = store.get_latest(&key).await.unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(payload, b"{\"n\":3}".to_vec());
    }

    #[tokio::test]
    async fn test_idempotent_replay_returns_existing_version() {
        let store = InMemoryArtifactStore::new();
        let key = ArtifactKey::new("repo", "commit", "settings", ArtifactKind::Files);

        let first = store
            .put_artifact(&key, b"{}".to_vec(), Some("job:merge"))
            .await
            .unwrap();
        let replay = store
            .put_artifact(&key, b"{}".to_vec(), Some("job:merge"))
            .await
            .unwrap();
        assert_eq!(first.version, replay.version);

        let other_job = store
            .put_artifact(&key, b"{}".to_vec(), Some("job2:merge"))
            .await
            .unwrap();
        assert_eq!(other_job.version, 2);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_not_found() {
        let store = InMemoryArtifactStore::new();
        let key = ArtifactKey::new("repo", "commit", "settings", ArtifactKind::Metrics);
        assert!(matches!(
            store.get_latest(&key).await,
            Err(AppError::NotFound(_))
        ));
    }
}
