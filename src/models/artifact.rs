use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Kinds of pipeline output
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
    EnumIter, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Tree,
    Files,
    Graph,
    Summaries,
    Capabilities,
    Metrics,
}

/// Scope under which versions of one artifact kind accumulate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactKey {
    pub repo_id: String,
    pub commit_hash: String,
    pub settings_hash: String,
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    pub fn new(
        repo_id: impl Into<String>,
        commit_hash: impl Into<String>,
        settings_hash: impl Into<String>,
        kind: ArtifactKind,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            commit_hash: commit_hash.into(),
            settings_hash: settings_hash.into(),
            kind,
        }
    }

    pub fn with_kind(&self, kind: ArtifactKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Stored metadata for one artifact version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub version: u32,
    pub uri: String,
    pub bytes: u64,
    pub sha256: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub schema_version: u32,
    pub generator_version: String,
    pub created_at: DateTime<Utc>,
}

/// Versions available for one kind under one settings hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSummary {
    pub settings_hash: String,
    pub kind: ArtifactKind,
    pub latest_version: u32,
    pub versions: Vec<u32>,
}
