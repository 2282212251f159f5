//! Shapes of the analysis artifacts (`tree`, `files`, `graph`, `summaries`,
//! `capabilities`) and of the parse batch output that feeds `files`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{AsRefStr, Display};

/// One file found under the snapshot root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredFile {
    /// `/`-separated path relative to the snapshot root
    pub path: String,
    /// Lowercased extension including the dot, empty when there is none
    pub ext: String,
    pub language: String,
    pub size: Option<u64>,
    pub lines: Option<u64>,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: TreeNodeType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeNodeType {
    Dir,
    File,
}

/// The `tree` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreePayload {
    pub repo_id: String,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<DiscoveredFile>,
    pub languages: BTreeMap<String, usize>,
    pub tree: TreeNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImportKind {
    Esm,
    Cjs,
    Py,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRef {
    pub raw: String,
    pub kind: ImportKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbols {
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default)]
    pub classes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hints {
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub is_route: bool,
    #[serde(default)]
    pub is_react_component: bool,
    #[serde(default, rename = "isAPI")]
    pub is_api: bool,
}

/// What a parser extracts from one source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutcome {
    #[serde(default)]
    pub imports: Vec<ImportRef>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub symbols: Symbols,
    #[serde(default)]
    pub hints: Hints,
}

/// One entry of the `files` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFile {
    pub path: String,
    pub language: String,
    pub ext: String,
    pub size: Option<u64>,
    pub lines: Option<u64>,
    pub symbols: Symbols,
    pub imports: Vec<ImportRef>,
    pub exports: Vec<String>,
    pub hints: Hints,
    pub warnings: Vec<String>,
    pub blurb: String,
}

impl ParsedFile {
    /// Entry with metadata only, before (or instead of) parsing
    pub fn from_meta(meta: &DiscoveredFile) -> Self {
        Self {
            path: meta.path.clone(),
            language: meta.language.clone(),
            ext: meta.ext.clone(),
            size: meta.size,
            lines: meta.lines,
            symbols: Symbols::default(),
            imports: Vec::new(),
            exports: Vec::new(),
            hints: Hints::default(),
            warnings: Vec::new(),
            blurb: String::new(),
        }
    }
}

/// Non-fatal problem found while analysing a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisWarning {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl AnalysisWarning {
    pub fn new(code: &str, message: impl Into<String>, file: Option<&str>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            file: file.map(str::to_string),
        }
    }
}

/// Result of one parse batch, stored as the task output and gathered by merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutput {
    pub batch_index: usize,
    pub files: Vec<ParsedFile>,
    pub warnings: Vec<AnalysisWarning>,
    pub parsed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesSummary {
    pub total_files: usize,
    pub languages: BTreeMap<String, usize>,
}

/// The `files` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesPayload {
    pub repo_id: String,
    pub generated_at: DateTime<Utc>,
    pub summary: FilesSummary,
    pub files: Vec<ParsedFile>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub in_degree: usize,
    pub out_degree: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    /// The import string as written
    pub to: String,
    pub external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphMetrics {
    pub num_nodes: usize,
    pub num_edges: usize,
    pub top_hubs: Vec<String>,
}

/// The `graph` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphPayload {
    pub repo_id: String,
    pub generated_at: DateTime<Utc>,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub warnings: Vec<String>,
    pub metrics: GraphMetrics,
}

impl GraphPayload {
    /// Resolved internal targets imported by `path`
    pub fn internal_deps(&self, path: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.from == path && !e.external)
            .filter_map(|e| e.resolved.clone())
            .collect()
    }

    /// Raw specifiers of external imports made by `path`
    pub fn external_deps(&self, path: &str) -> Vec<String> {
        self.edges
            .iter()
            .filter(|e| e.from == path && e.external)
            .map(|e| e.to.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SummarySource {
    Heuristic,
    Llm,
}

/// Per-file entry of the `summaries` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub purpose: Option<String>,
    pub blurb: String,
    #[serde(default)]
    pub key_functions: Vec<String>,
    #[serde(default)]
    pub internal_dependencies: Vec<String>,
    #[serde(default)]
    pub external_dependencies: Vec<String>,
    pub source: SummarySource,
}

/// The `summaries` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummariesPayload {
    pub repo_id: String,
    pub generated_at: DateTime<Utc>,
    pub summarizer: String,
    pub files: Vec<FileSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Swimlane {
    Web,
    Api,
    Workers,
    Other,
}

/// A flow that starts at a route or API entrypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub id: String,
    pub title: String,
    pub entrypoint: String,
    pub lane: Swimlane,
    /// Entrypoint followed by its direct internal dependencies
    pub files: Vec<String>,
    pub hubs_touched: Vec<String>,
}

/// The `capabilities` artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesPayload {
    pub repo_id: String,
    pub generated_at: DateTime<Utc>,
    pub capabilities: Vec<Capability>,
    pub swimlanes: BTreeMap<Swimlane, Vec<String>>,
}
