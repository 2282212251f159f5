use super::models::{DiscoveredFile, TreeNode, TreeNodeType, TreePayload};
use crate::config::AnalysisConfig;
use crate::error::{AppError, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use walkdir::WalkDir;

pub const SKIP_TOO_LARGE: &str = "file_too_large_for_parse";
pub const SKIP_STAT_FAILED: &str = "stat_failed";

/// Language label for a lowercased extension (including the dot)
pub fn language_for(ext: &str) -> &'static str {
    match ext {
        ".js" | ".mjs" | ".cjs" | ".jsx" => "javascript",
        ".ts" | ".tsx" => "typescript",
        ".py" => "python",
        _ => "other",
    }
}

/// Whether a parser understands files of this language
pub fn is_source_language(language: &str) -> bool {
    matches!(language, "javascript" | "typescript" | "python")
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Walk `root` and describe every file that is not ignored, sorted by path
pub fn discover(root: &Path, config: &AnalysisConfig) -> Result<Vec<DiscoveredFile>> {
    if !root.is_dir() {
        return Err(AppError::NotFound(format!(
            "snapshot directory {} is missing",
            root.display()
        )));
    }

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !config
                    .ignored_dirs
                    .iter()
                    .any(|dir| entry.file_name().to_string_lossy() == dir.as_str())
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let ext = extension_of(entry.path());
        if config.ignored_exts.iter().any(|ignored| ignored.eq_ignore_ascii_case(&ext)) {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| AppError::Internal(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let language = language_for(&ext).to_string();

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::debug!(path = %relative, error = %e, "Stat failed during discovery");
                files.push(DiscoveredFile {
                    path: relative,
                    ext,
                    language,
                    size: None,
                    lines: None,
                    skipped: true,
                    skip_reason: Some(SKIP_STAT_FAILED.to_string()),
                });
                continue;
            }
        };

        if size > config.max_file_bytes {
            files.push(DiscoveredFile {
                path: relative,
                ext,
                language,
                size: Some(size),
                lines: None,
                skipped: true,
                skip_reason: Some(SKIP_TOO_LARGE.to_string()),
            });
            continue;
        }

        files.push(DiscoveredFile {
            lines: count_lines(entry.path()),
            path: relative,
            ext,
            language,
            size: Some(size),
            skipped: false,
            skip_reason: None,
        });
    }

    Ok(files)
}

/// Best-effort line count, a trailing line without newline counts
fn count_lines(path: &Path) -> Option<u64> {
    let file = fs::File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut lines = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return Some(lines),
            Ok(_) => lines += 1,
            Err(_) => return None,
        }
    }
}

pub fn language_histogram<'a>(languages: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for language in languages {
        *counts.entry(language.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Nest a sorted list of paths into a directory tree rooted at `""`
pub fn build_tree(files: &[DiscoveredFile]) -> TreeNode {
    let mut root = TreeNode {
        name: String::new(),
        path: String::new(),
        node_type: TreeNodeType::Dir,
        children: Vec::new(),
    };

    for file in files {
        let parts: Vec<&str> = file.path.split('/').collect();
        let mut node = &mut root;
        for (depth, part) in parts.iter().enumerate() {
            let is_leaf = depth + 1 == parts.len();
            let path = parts[..=depth].join("/");
            let position = node.children.iter().position(|c| c.name == *part);
            let index = match position {
                Some(index) => index,
                None => {
                    node.children.push(TreeNode {
                        name: part.to_string(),
                        path,
                        node_type: if is_leaf {
                            TreeNodeType::File
                        } else {
                            TreeNodeType::Dir
                        },
                        children: Vec::new(),
                    });
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index];
        }
    }

    root
}

pub fn tree_payload(repo_id: &str, files: Vec<DiscoveredFile>) -> TreePayload {
    TreePayload {
        repo_id: repo_id.to_string(),
        generated_at: Utc::now(),
        languages: language_histogram(files.iter().map(|f| f.language.as_str())),
        tree: build_tree(&files),
        files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_discover_skips_ignored_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "src/b.ts", "export const b = 1;\n");
        write(root, "src/a.js", "const a = 1;\nmodule.exports = a;");
        write(root, "node_modules/x/index.js", "x");
        write(root, ".git/HEAD", "ref");
        write(root, "logo.PNG", "png");
        write(root, "app/main.py", "import os\n");

        let files = discover(root, &AnalysisConfig::default()).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["app/main.py", "src/a.js", "src/b.ts"]);

        let a = &files[1];
        assert_eq!(a.language, "javascript");
        assert_eq!(a.ext, ".js");
        assert_eq!(a.lines, Some(2));
        assert!(!a.skipped);
    }

    #[test]
    fn test_large_files_are_listed_but_skipped() {
        let temp_dir = TempDir::new().unwrap();
        write(temp_dir.path(), "big.ts", &"x".repeat(64));
        let config = AnalysisConfig {
            max_file_bytes: 16,
            ..AnalysisConfig::default()
        };

        let files = discover(temp_dir.path(), &config).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].skipped);
        assert_eq!(files[0].skip_reason.as_deref(), Some(SKIP_TOO_LARGE));
        assert_eq!(files[0].size, Some(64));
    }

    #[test]
    fn test_missing_root_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = discover(&temp_dir.path().join("gone"), &AnalysisConfig::default()).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_tree_payload_nests_directories() {
        let files: Vec<DiscoveredFile> = ["src/lib/a.ts", "src/b.py", "README.md"]
            .iter()
            .map(|p| DiscoveredFile {
                path: p.to_string(),
                ext: String::new(),
                language: language_for(&extension_of(Path::new(p))).to_string(),
                size: Some(1),
                lines: Some(1),
                skipped: false,
                skip_reason: None,
            })
            .collect();

        let payload = tree_payload("repo", files);
        assert_eq!(payload.languages["typescript"], 1);
        assert_eq!(payload.languages["other"], 1);

        let src = payload.tree.children.iter().find(|c| c.name == "src").unwrap();
        assert_eq!(src.node_type, TreeNodeType::Dir);
        let lib = src.children.iter().find(|c| c.name == "lib").unwrap();
        assert_eq!(lib.children[0].path, "src/lib/a.ts");
        assert_eq!(lib.children[0].node_type, TreeNodeType::File);
    }
}
