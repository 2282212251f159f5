use crate::config::{Config, ParserMode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SnapshotStatus {
    /// Recorded at submit, files not yet extracted
    Pending,
    /// Extracted under `snapshots/{commit_hash}`
    Ready,
}

/// Content-hashed repository state shared by every job that uploads the same files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Short form of the content hash, used in artifact paths
    pub id: String,
    pub content_hash: String,
    pub repo_id: String,
    pub status: SnapshotStatus,
    pub file_count: usize,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(content_hash: impl Into<String>, file_count: usize, total_bytes: u64) -> Self {
        let content_hash = content_hash.into();
        Self {
            id: commit_hash(&content_hash),
            content_hash,
            repo_id: uuid::Uuid::new_v4().to_string(),
            status: SnapshotStatus::Pending,
            file_count,
            total_bytes,
            created_at: Utc::now(),
        }
    }

    pub fn commit_hash(&self) -> &str {
        &self.id
    }
}

pub fn commit_hash(content_hash: &str) -> String {
    content_hash.chars().take(16).collect()
}

/// Everything that changes analysis output; hashed into the artifact scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    pub parse_batch_size: usize,
    pub ignored_dirs: Vec<String>,
    pub ignored_exts: Vec<String>,
    pub max_file_bytes: u64,
    pub parser: ParserMode,
    pub summarizer_model: Option<String>,
}

impl AnalysisSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut ignored_dirs = config.analysis.ignored_dirs.clone();
        ignored_dirs.sort();
        let mut ignored_exts = config.analysis.ignored_exts.clone();
        ignored_exts.sort();
        Self {
            parse_batch_size: config.analysis.parse_batch_size,
            ignored_dirs,
            ignored_exts,
            max_file_bytes: config.analysis.max_file_bytes,
            parser: config.analysis.parser,
            summarizer_model: config
                .llm
                .api_key
                .as_ref()
                .map(|_| config.llm.model.clone()),
        }
    }

    /// 16 hex chars of sha256 over the canonical JSON form
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = format!("{:x}", Sha256::digest(&canonical));
        digest[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_ids_derive_from_content_hash() {
        let snapshot = Snapshot::new("abcdef0123456789abcdef", 3, 120);
        assert_eq!(snapshot.id, "abcdef0123456789");
        assert_eq!(snapshot.status, SnapshotStatus::Pending);
    }

    #[test]
    fn test_settings_hash_tracks_analysis_settings() {
        let config = Config::default();
        let a = AnalysisSettings::from_config(&config);
        assert_eq!(a.hash(), AnalysisSettings::from_config(&config).hash());
        assert_eq!(a.hash().len(), 16);

        let mut changed = config.clone();
        changed.analysis.parse_batch_size = 10;
        assert_ne!(a.hash(), AnalysisSettings::from_config(&changed).hash());

        let mut reordered = config;
        reordered.analysis.ignored_dirs.reverse();
        assert_eq!(a.hash(), AnalysisSettings::from_config(&reordered).hash());
    }
}
