//! Import resolution and the file-level dependency graph.

use super::models::{FilesPayload, GraphEdge, GraphMetrics, GraphNode, GraphPayload};
use crate::metrics::IMPORTS_TOTAL;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};

const COMMON_ROOTS: &[&str] = &["src", "app", "lib", "server", "client"];
const ALIAS_ROOTS: &[&str] = &["src", "app"];
const TOP_HUBS: usize = 10;

/// Totals reported in the `imports_metrics` event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportsMetrics {
    pub total: usize,
    pub internal: usize,
    pub external: usize,
}

/// Best-effort resolver from an import string to a repository path
pub struct ImportResolver<'a> {
    nodes: &'a HashMap<String, usize>,
    top_dirs: BTreeSet<String>,
}

impl<'a> ImportResolver<'a> {
    pub fn new(nodes: &'a HashMap<String, usize>) -> Self {
        let top_dirs = nodes
            .keys()
            .filter_map(|p| p.split_once('/').map(|(first, _)| first.to_string()))
            .collect();
        Self { nodes, top_dirs }
    }

    fn candidates(base: &str) -> Vec<String> {
        let mut out = vec![base.to_string()];
        for ext in [".ts", ".tsx", ".js", ".jsx", ".py"] {
            out.push(format!("{}{}", base, ext));
        }
        for index in ["index.ts", "index.tsx", "index.js", "index.jsx", "__init__.py"] {
            out.push(format!("{}/{}", base, index));
        }
        out
    }

    fn first_known(&self, candidates: &[String]) -> Option<String> {
        candidates.iter().find(|c| self.nodes.contains_key(*c)).cloned()
    }

    /// Resolve `raw` as imported from `from`; `None` means external or unknown
    pub fn resolve(&self, from: &str, raw: &str) -> Option<String> {
        let raw = raw.trim();

        if raw.starts_with('.') {
            let base = match from.rsplit_once('/') {
                Some((dir, _)) => format!("{}/{}", dir, raw),
                None => raw.to_string(),
            };
            let normalized = normalize(&base)?;
            return self.first_known(&Self::candidates(&normalized));
        }

        let raw = raw.trim_start_matches('/');
        let mut groups: Vec<Vec<String>> = Vec::new();

        if let Some(tail) = raw.strip_prefix("@/") {
            let tail = tail.trim_start_matches('/');
            let present: Vec<&str> = ALIAS_ROOTS
                .iter()
                .copied()
                .filter(|r| self.top_dirs.contains(*r))
                .collect();
            let roots = if present.is_empty() { ALIAS_ROOTS.to_vec() } else { present };
            groups.push(
                roots
                    .iter()
                    .flat_map(|root| Self::candidates(&format!("{}/{}", root, tail)))
                    .collect(),
            );
        }

        let first = raw.split('/').next().unwrap_or("");
        if COMMON_ROOTS.contains(&first) && self.top_dirs.contains(first) {
            groups.push(Self::candidates(raw));
        }

        if raw.contains('.') && !raw.contains('/') {
            let module = raw.replace('.', "/");
            let mut dotted = Self::candidates(&module);
            for root in &self.top_dirs {
                dotted.extend(Self::candidates(&format!("{}/{}", root, module)));
            }
            groups.push(dotted);
        }

        if !raw.contains('.') && !raw.contains('/') && !raw.starts_with('@') {
            groups.push(
                self.top_dirs
                    .iter()
                    .flat_map(|root| Self::candidates(&format!("{}/{}", root, raw)))
                    .collect(),
            );
        }

        if raw.contains('/') {
            groups.push(Self::candidates(raw));
        }

        groups.iter().find_map(|group| self.first_known(group))
    }
}

/// Collapse `.` and `..` segments; escaping the root yields `None`
fn normalize(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }
    Some(parts.join("/"))
}

/// An unresolved import that still looks like it was meant to be local
fn looks_local(raw: &str) -> bool {
    let raw = raw.trim();
    raw.starts_with('.')
        || raw.starts_with('/')
        || raw.starts_with("@/")
        || (["src/", "app/", "lib/", "server/", "client/"]
            .iter()
            .any(|root| raw.starts_with(root)))
        || (raw.contains('.') && !raw.contains('/'))
}

/// Build the `graph` artifact from the merged `files` artifact
pub fn build_graph(files: &FilesPayload) -> (GraphPayload, ImportsMetrics) {
    let index: HashMap<String, usize> = files
        .files
        .iter()
        .enumerate()
        .map(|(i, f)| (f.path.clone(), i))
        .collect();
    let mut nodes: Vec<GraphNode> = files
        .files
        .iter()
        .map(|f| GraphNode {
            id: f.path.clone(),
            in_degree: 0,
            out_degree: 0,
        })
        .collect();

    let resolver = ImportResolver::new(&index);
    let mut edges = Vec::new();
    let mut warnings = Vec::new();
    let mut metrics = ImportsMetrics::default();

    for (from_index, file) in files.files.iter().enumerate() {
        for import in &file.imports {
            if import.raw.trim().is_empty() {
                continue;
            }
            metrics.total += 1;
            match resolver.resolve(&file.path, &import.raw) {
                Some(resolved) => {
                    metrics.internal += 1;
                    nodes[from_index].out_degree += 1;
                    if let Some(&to_index) = index.get(&resolved) {
                        nodes[to_index].in_degree += 1;
                    }
                    edges.push(GraphEdge {
                        from: file.path.clone(),
                        to: import.raw.clone(),
                        external: false,
                        resolved: Some(resolved),
                    });
                }
                None => {
                    metrics.external += 1;
                    if looks_local(&import.raw) {
                        warnings.push(format!(
                            "Unresolved local import '{}' in {}",
                            import.raw, file.path
                        ));
                    }
                    edges.push(GraphEdge {
                        from: file.path.clone(),
                        to: import.raw.clone(),
                        external: true,
                        resolved: None,
                    });
                }
            }
        }
    }

    IMPORTS_TOTAL
        .with_label_values(&["internal"])
        .inc_by(metrics.internal as f64);
    IMPORTS_TOTAL
        .with_label_values(&["external"])
        .inc_by(metrics.external as f64);

    let mut ranked: Vec<&GraphNode> = nodes.iter().collect();
    // stable sort keeps path order among equal degrees
    ranked.sort_by(|a, b| (b.in_degree + b.out_degree).cmp(&(a.in_degree + a.out_degree)));
    let top_hubs = ranked.iter().take(TOP_HUBS).map(|n| n.id.clone()).collect();

    let payload = GraphPayload {
        repo_id: files.repo_id.clone(),
        generated_at: Utc::now(),
        metrics: GraphMetrics {
            num_nodes: nodes.len(),
            num_edges: edges.len(),
            top_hubs,
        },
        nodes,
        edges,
        warnings,
    };
    (payload, metrics)
}
