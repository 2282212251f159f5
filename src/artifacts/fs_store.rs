use super::{is_replay, layout, new_record, record_written, ArtifactStore};
use crate::error::{AppError, Result};
use crate::models::{ArtifactKey, ArtifactKind, ArtifactRecord, ArtifactSummary};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// Filesystem artifact store laid out exactly like the object-store key scheme
#[derive(Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, key: &ArtifactKey) -> Arc<Mutex<()>> {
        let name = format!("{}/{}", layout::scope_prefix(key), key.kind);
        self.locks
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Versions of `key.kind` present on disk, ascending
    async fn versions(&self, key: &ArtifactKey) -> Result<Vec<u32>> {
        let dir = self.root.join(layout::scope_prefix(key));
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some((kind, version)) = layout::parse_payload_name(&entry.file_name().to_string_lossy()) {
                if kind == key.kind {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_record(&self, key: &ArtifactKey, version: u32, payload: &[u8]) -> Result<ArtifactRecord> {
        let meta = self.root.join(layout::meta_path(key, version));
        match tokio::fs::read(&meta).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            // Payload left by a writer that never published metadata; derive what we can
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ArtifactRecord {
                created_at: Utc::now(),
                ..new_record(key, version, payload, None)
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` to a synced scratch file in `dir`; the name never parses as a version
    async fn stage(dir: &Path, kind: ArtifactKind, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(".{}.{}.tmp", kind, Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok(path)
    }

    async fn discard(staged: &Path) {
        if let Err(e) = tokio::fs::remove_file(staged).await {
            warn!(path = ?staged, error = %e, "Failed to remove staged artifact file");
        }
    }

    /// Link a complete staged file into place; `Ok(false)` when `path` is taken
    async fn publish(staged: &Path, path: &Path) -> Result<bool> {
        match tokio::fs::hard_link(staged, path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the first free version from `version` up. Metadata is linked
    /// before the payload, so a visible payload is always complete and described.
    async fn publish_from(
        &self,
        key: &ArtifactKey,
        mut version: u32,
        staged_payload: &Path,
        payload: &[u8],
        idempotency_key: Option<&str>,
    ) -> Result<ArtifactRecord> {
        let dir = self.root.join(layout::scope_prefix(key));
        loop {
            let record = new_record(key, version, payload, idempotency_key);
            let meta_path = self.root.join(layout::meta_path(key, version));
            let staged_meta = Self::stage(&dir, key.kind, &serde_json::to_vec_pretty(&record)?).await?;
            let claimed = Self::publish(&staged_meta, &meta_path).await;
            Self::discard(&staged_meta).await;
            if !claimed? {
                version += 1;
                continue;
            }

            let payload_path = self.root.join(layout::payload_path(key, version));
            if Self::publish(staged_payload, &payload_path).await? {
                return Ok(record);
            }
            // A payload without metadata already holds this version
            tokio::fs::remove_file(&meta_path).await?;
            version += 1;
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put_artifact(
        &self,
        key: &ArtifactKey,
        payload: Vec<u8>,
        idempotency_key: Option<&str>,
    ) -> Result<ArtifactRecord> {
        layout::check_key(key)?;

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let version = match self.versions(key).await?.last().copied() {
            Some(latest) => {
                let (record, _) = self.get_version(key, latest).await?;
                if is_replay(&record, idempotency_key) {
                    return Ok(record);
                }
                latest + 1
            }
            None => 1,
        };

        // Another process may hold the same version; never overwrite, move up instead
        let dir = self.root.join(layout::scope_prefix(key));
        let staged = Self::stage(&dir, key.kind, &payload).await?;
        let published = self
            .publish_from(key, version, &staged, &payload, idempotency_key)
            .await;
        Self::discard(&staged).await;
        let record = published?;

        record_written(&record);
        Ok(record)
    }

    async fn latest_record(&self, key: &ArtifactKey) -> Result<Option<ArtifactRecord>> {
        match self.versions(key).await?.last() {
            Some(&version) => Ok(Some(self.get_version(key, version).await?.0)),
            None => Ok(None),
        }
    }

    async fn get_version(&self, key: &ArtifactKey, version: u32) -> Result<(ArtifactRecord, Vec<u8>)> {
        layout::check_key(key)?;
        let path = self.root.join(layout::payload_path(key, version));
        let payload = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!(
                    "{} not found",
                    layout::payload_path(key, version)
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let record = self.read_record(key, version, &payload).await?;
        Ok((record, payload))
    }

    async fn list(&self, repo_id: &str, commit_hash: &str) -> Result<Vec<ArtifactSummary>> {
        layout::check_segment("repo id", repo_id)?;
        layout::check_segment("commit hash", commit_hash)?;

        let dir = self.root.join(layout::snapshot_prefix(repo_id, commit_hash));
        let mut scopes = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut grouped: BTreeMap<(String, ArtifactKind), Vec<u32>> = BTreeMap::new();
        while let Some(scope) = scopes.next_entry().await? {
            if !scope.file_type().await?.is_dir() {
                continue;
            }
            let settings_hash = scope.file_name().to_string_lossy().to_string();
            let mut files = tokio::fs::read_dir(scope.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if let Some((kind, version)) = layout::parse_payload_name(&file.file_name().to_string_lossy()) {
                    grouped
                        .entry((settings_hash.clone(), kind))
                        .or_default()
                        .push(version);
                }
            }
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
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_layout_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let key = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Tree);

        let record = store.put_artifact(&key, b"{}".to_vec(), None).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.uri, "repos/repo1/snapshots/abc123/set1/tree.v1.json");
        assert!(temp_dir
            .path()
            .join("repos/repo1/snapshots/abc123/set1/tree.v1.json")
            .exists());
        assert!(temp_dir
            .path()
            .join("repos/repo1/snapshots/abc123/set1/tree.v1.meta.json")
            .exists());
    }

    #[tokio::test]
    async fn test_fs_never_overwrites_existing_version() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let key = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Graph);

        store.put_artifact(&key, b"{\"a\":1}".to_vec(), None).await.unwrap();
        let second = store.put_artifact(&key, b"{\"a\":2}".to_vec(), None).await.unwrap();
        assert_eq!(second.version, 2);

        let (first, payload) = store.get_version(&key, 1).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(payload, b"{\"a\":1}".to_vec());
    }

    #[tokio::test]
    async fn test_fs_concurrent_writers_get_distinct_versions() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let key = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Summaries);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put_artifact(&key, format!("{{\"i\":{}}}", i).into_bytes(), None)
                    .await
                    .unwrap()
                    .version
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_fs_list_groups_by_settings_and_kind() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let graph = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Graph);
        store.put_artifact(&graph, b"{}".to_vec(), None).await.unwrap();
        store.put_artifact(&graph, b"[]".to_vec(), None).await.unwrap();
        store
            .put_artifact(&graph.with_kind(ArtifactKind::Files), b"{}".to_vec(), None)
            .await
            .unwrap();

        let listed = store.list("repo1", "abc123").await.unwrap();
        assert_eq!(listed.len(), 2);
        let graph_summary = listed.iter().find(|s| s.kind == ArtifactKind::Graph).unwrap();
        assert_eq!(graph_summary.versions, vec![1, 2]);
        assert_eq!(graph_summary.latest_version, 2);

        assert!(store.list("repo1", "missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fs_interrupted_writes_are_never_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let key = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Graph);
        store.put_artifact(&key, b"{\"v\":1}".to_vec(), None).await.unwrap();

        // Leftovers of a writer that died mid-way: a torn scratch file and
        // metadata claiming v2 without its payload
        let dir = temp_dir.path().join(layout::scope_prefix(&key));
        std::fs::write(dir.join(".graph.dead.tmp"), b"{\"v\":").unwrap();
        std::fs::write(dir.join(layout::meta_name(ArtifactKind::Graph, 2)), b"{}").unwrap();

        let latest = store.latest_record(&key).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);

        let record = store
            .put_artifact(&key, b"{\"v\":3}".to_vec(), Some("graph-task"))
            .await
            .unwrap();
        assert_eq!(record.version, 3);
        let (latest, payload) = store.get_version(&key, 3).await.unwrap();
        assert_eq!(latest.idempotency_key.as_deref(), Some("graph-task"));
        assert_eq!(payload, b"{\"v\":3}".to_vec());

        // Replay by key finds the published version
        let replay = store
            .put_artifact(&key, b"{\"v\":4}".to_vec(), Some("graph-task"))
            .await
            .unwrap();
        assert_eq!(replay.version, 3);

        let scratch: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert_eq!(scratch, vec![".graph.dead.tmp".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fs_readers_never_see_partial_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(temp_dir.path()).unwrap();
        let key = ArtifactKey::new("repo1", "abc123", "set1", ArtifactKind::Files);

        let writer = {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let body = serde_json::to_vec(&vec![i; 50_000]).unwrap();
                    store.put_artifact(&key, body, None).await.unwrap();
                }
            })
        };

        while !writer.is_finished() {
            if let Some(record) = store.latest_record(&key).await.unwrap() {
                let (_, payload) = store.get_version(&key, record.version).await.unwrap();
                assert_eq!(payload.len() as u64, record.bytes);
                serde_json::from_slice::<Vec<u32>>(&payload).unwrap();
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(store.latest_record(&key).await.unwrap().unwrap().version, 20);
    }
}
