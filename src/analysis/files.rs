use super::discover::{is_source_language, language_histogram};
use super::models::{
    AnalysisWarning, BatchOutput, DiscoveredFile, FilesPayload, FilesSummary, ImportRef, ParsedFile,
};
use super::parser::{FileParser, ProjectContext};
use crate::error::{AppError, ResourceLimit, Result};
use crate::metrics::helpers::record_file;
use chrono::Utc;
use std::path::Path;

pub const WARN_PARSE_TIMEOUT: &str = "parse_timeout";
pub const WARN_PARSE_FAILED: &str = "parse_failed";

/// Parse one batch of discovered files.
///
/// Per-file problems become warnings on the file and in the batch output.
/// Resource exhaustion other than a per-file timeout, and infrastructure
/// faults, fail the whole batch so the task can be retried.
pub async fn parse_batch(
    parser: &dyn FileParser,
    root: &Path,
    batch_index: usize,
    files: &[DiscoveredFile],
) -> Result<BatchOutput> {
    let context = ProjectContext::detect(root);
    let mut output = BatchOutput {
        batch_index,
        ..BatchOutput::default()
    };

    for meta in files {
        let mut entry = ParsedFile::from_meta(meta);

        if meta.skipped {
            let reason = meta.skip_reason.as_deref().unwrap_or("unknown");
            let message = format!("Skipped {} due to {}.", meta.path, reason);
            entry.warnings.push(message.clone());
            output
                .warnings
                .push(AnalysisWarning::new(reason, message, Some(&meta.path)));
            record_file(&meta.language, "skipped");
            output.skipped += 1;
        } else if !is_source_language(&meta.language) {
            output.skipped += 1;
        } else {
            match parser.parse(root, meta).await {
                Ok(outcome) => {
                    entry.imports = outcome.imports;
                    entry.exports = outcome.exports;
                    entry.symbols = outcome.symbols;
                    entry.hints = outcome.hints;
                    context.apply(&entry.ext, &mut entry.hints);
                    record_file(&meta.language, "parsed");
                    output.parsed += 1;
                }
                Err(AppError::ResourceExhausted {
                    reason: ResourceLimit::Timeout,
                    message,
                }) => {
                    tracing::warn!(file = %meta.path, parser = parser.name(), "Parse timed out");
                    let message = format!("Parse timed out for {}: {}", meta.path, message);
                    entry.warnings.push(message.clone());
                    output.warnings.push(AnalysisWarning::new(
                        WARN_PARSE_TIMEOUT,
                        message,
                        Some(&meta.path),
                    ));
                    record_file(&meta.language, "timeout");
                    output.skipped += 1;
                }
                Err(e @ AppError::ResourceExhausted { .. }) | Err(e @ AppError::Infrastructure(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(file = %meta.path, error = %e, "Parse failed");
                    let message = format!("Parse failed for {}: {}", meta.path, e);
                    entry.warnings.push(message.clone());
                    output.warnings.push(AnalysisWarning::new(
                        WARN_PARSE_FAILED,
                        message,
                        Some(&meta.path),
                    ));
                    record_file(&meta.language, "failed");
                    output.skipped += 1;
                }
            }
        }

        entry.blurb = file_blurb(&entry);
        output.files.push(entry);
    }

    Ok(output)
}

/// Assemble the `files` artifact from every batch output
pub fn merge_batches(repo_id: &str, outputs: Vec<BatchOutput>) -> FilesPayload {
    let mut files = Vec::new();
    let mut warnings = Vec::new();
    for output in outputs {
        files.extend(output.files);
        warnings.extend(output.warnings.into_iter().map(|w| w.message));
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    FilesPayload {
        repo_id: repo_id.to_string(),
        generated_at: Utc::now(),
        summary: FilesSummary {
            total_files: files.len(),
            languages: language_histogram(files.iter().map(|f| f.language.as_str())),
        },
        files,
        warnings,
    }
}

/// Whether an import string points inside the repository
pub fn looks_internal(import: &ImportRef) -> bool {
    let raw = import.raw.trim();
    raw.starts_with('.') || raw.starts_with('/') || raw.starts_with("@/")
}

fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("{} {}", count, singular)
    } else {
        format!("{} {}", count, plural)
    }
}

/// One-line description built from hints, symbol counts and import counts
pub fn file_blurb(entry: &ParsedFile) -> String {
    let hints = &entry.hints;
    let mut file_type = if hints.is_route {
        "route".to_string()
    } else if hints.is_react_component {
        "React component".to_string()
    } else if hints.is_api {
        "API endpoint".to_string()
    } else {
        "file".to_string()
    };
    if let Some(framework) = &hints.framework {
        file_type = format!("{} {}", framework, file_type);
    }

    let mut parts = vec![file_type];

    let functions = entry.symbols.functions.len();
    let classes = entry.symbols.classes.len();
    match (functions, classes) {
        (0, 0) => {}
        (f, 0) => parts.push(format!("with {}", plural(f, "function", "functions"))),
        (0, c) => parts.push(format!("with {}", plural(c, "class", "classes"))),
        (f, c) => parts.push(format!(
            "with {} and {}",
            plural(f, "function", "functions"),
            plural(c, "class", "classes")
        )),
    }

    let (internal, external): (Vec<&ImportRef>, Vec<&ImportRef>) =
        entry.imports.iter().partition(|i| looks_internal(i));
    match (internal.len(), external.len()) {
        (0, 0) => {}
        (i, 0) => parts.push(format!("imports {}", plural(i, "internal module", "internal modules"))),
        (0, e) => parts.push(format!("imports {}", plural(e, "external module", "external modules"))),
        (i, e) => parts.push(format!("imports {} internal and {} external modules", i, e)),
    }

    if hints.is_react_component && !internal.is_empty() {
        let names: Vec<&str> = internal
            .iter()
            .map(|i| i.raw.rsplit('/').next().unwrap_or(&i.raw))
            .collect();
        parts.push(format!("imports: {}", names.iter().take(3).cloned().collect::<Vec<_>>().join(", ")));
        if names.len() > 3 {
            parts.push(format!("and {} more", names.len() - 3));
        }
    }

    format!("{}.", parts.join(". "))
}
