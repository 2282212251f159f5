//! Source parsers. The heuristic parser covers JS/TS and Python with regular
//! expressions; the subprocess parser delegates each file to an external
//! command that prints a JSON parse result.

use super::models::{DiscoveredFile, Hints, ImportKind, ImportRef, ParseOutcome, Symbols};
use crate::config::{AnalysisConfig, ParserMode};
use crate::error::{AppError, ResourceLimit, Result};
use crate::limits::SubprocessLimiter;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

lazy_static! {
    // import X from "mod" | import {X} from "mod" | import "mod"
    static ref RE_IMPORT: Regex =
        Regex::new(r#"(?m)^\s*import\s+(?:[^"']+from\s+)?['"]([^'"]+)['"]"#).expect("valid regex");
    static ref RE_REQUIRE: Regex =
        Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex");
    static ref RE_EXPORT_DEFAULT: Regex =
        Regex::new(r"(?m)^\s*export\s+default\b").expect("valid regex");
    static ref RE_EXPORT_ANY: Regex =
        Regex::new(r"(?m)^\s*export\s+(?:default|const|let|var|function|class)\b").expect("valid regex");
    static ref RE_FUNC: Regex =
        Regex::new(r"(?m)^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z0-9_]+)\s*\(").expect("valid regex");
    static ref RE_CLASS: Regex =
        Regex::new(r"(?m)^\s*(?:export\s+)?class\s+([A-Za-z0-9_]+)").expect("valid regex");
    static ref RE_ARROW_DECL: Regex = Regex::new(
        r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z0-9_]+)\s*(?::\s*[^=]+)?=\s*(?:async\s*)?\(?[A-Za-z0-9_,\s{}:*=\[\]\.]*\)?\s*=>"
    )
    .expect("valid regex");
    static ref RE_RETURNS_JSX: Regex = Regex::new(r"return\s*\(?\s*<").expect("valid regex");
    static ref RE_JSX_LITERAL: Regex = Regex::new(r"<[A-Za-z]").expect("valid regex");

    static ref RE_PY_IMPORT: Regex = Regex::new(r"(?m)^import\s+([^#\n]+)").expect("valid regex");
    static ref RE_PY_FROM: Regex =
        Regex::new(r"(?m)^from\s+(\.*)([A-Za-z0-9_\.]*)\s+import\b").expect("valid regex");
    static ref RE_PY_DEF: Regex =
        Regex::new(r"(?m)^(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("valid regex");
    static ref RE_PY_CLASS: Regex =
        Regex::new(r"(?m)^class\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex");
    static ref RE_PY_DECORATED_DEF: Regex =
        Regex::new(r"(?m)^@[^\n]+\n(?:@[^\n]+\n)*(?:async\s+)?def\s").expect("valid regex");
}

#[async_trait]
pub trait FileParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parse one discovered source file under `root`.
    ///
    /// A per-file timeout surfaces as `ResourceExhausted { reason: timeout }`.
    async fn parse(&self, root: &Path, file: &DiscoveredFile) -> Result<ParseOutcome>;
}

/// Build the parser selected by `analysis.parser`
pub fn create_parser(config: &AnalysisConfig, limiter: SubprocessLimiter) -> Result<Arc<dyn FileParser>> {
    match config.parser {
        ParserMode::Heuristic => Ok(Arc::new(HeuristicParser::new(limiter.file_timeout))),
        ParserMode::Subprocess => {
            let parser = SubprocessParser::new(config.parser_command.clone(), limiter)?;
            Ok(Arc::new(parser))
        }
    }
}

/// Regex parser for JS/TS and Python
#[derive(Debug, Clone)]
pub struct HeuristicParser {
    file_timeout: Duration,
}

impl HeuristicParser {
    pub fn new(file_timeout: Duration) -> Self {
        Self { file_timeout }
    }
}

impl Default for HeuristicParser {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

#[async_trait]
impl FileParser for HeuristicParser {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn parse(&self, root: &Path, file: &DiscoveredFile) -> Result<ParseOutcome> {
        let path = root.join(&file.path);
        let bytes = tokio::fs::read(&path).await?;
        let relative = file.path.clone();
        let ext = file.ext.clone();
        let language = file.language.clone();

        let work = tokio::task::spawn_blocking(move || {
            let text = String::from_utf8_lossy(&bytes);
            match language.as_str() {
                "javascript" | "typescript" => parse_js_ts(&relative, &ext, &text),
                "python" => parse_python(&text),
                _ => ParseOutcome::default(),
            }
        });

        match tokio::time::timeout(self.file_timeout, work).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(AppError::Internal(format!("parser task failed: {}", e))),
            Err(_) => Err(AppError::exhausted(
                ResourceLimit::Timeout,
                format!("{} took longer than {:?}", file.path, self.file_timeout),
            )),
        }
    }
}

fn is_pascal(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

fn captures(re: &Regex, text: &str) -> Vec<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Route/API/component hints from the path and the source text
fn js_hints(path: &str, ext: &str, text: &str, functions: &[String], classes: &[String]) -> Hints {
    let mut hints = Hints::default();
    let rooted = format!("/{}", path);

    if rooted.contains("/pages/") || rooted.contains("/app/") {
        hints.framework = Some("nextjs".to_string());
        hints.is_route = true;
        if rooted.contains("/pages/api/") || rooted.contains("/app/api/") {
            hints.is_api = true;
        }
    }

    if ext == ".tsx" || ext == ".jsx" {
        let has_jsx = RE_RETURNS_JSX.is_match(text) || RE_JSX_LITERAL.is_match(text);
        let has_default_export = RE_EXPORT_DEFAULT.is_match(text);
        let pascal_symbol = functions.iter().chain(classes).any(|n| is_pascal(n));
        if has_jsx && (has_default_export || pascal_symbol) {
            hints.is_react_component = true;
        }
    }

    hints
}

pub fn parse_js_ts(path: &str, ext: &str, text: &str) -> ParseOutcome {
    let mut imports: Vec<ImportRef> = captures(&RE_IMPORT, text)
        .into_iter()
        .map(|raw| ImportRef {
            raw,
            kind: ImportKind::Esm,
        })
        .collect();
    imports.extend(captures(&RE_REQUIRE, text).into_iter().map(|raw| ImportRef {
        raw,
        kind: ImportKind::Cjs,
    }));

    let mut exports = Vec::new();
    if RE_EXPORT_ANY.is_match(text) {
        let kind = if RE_EXPORT_DEFAULT.is_match(text) {
            "default"
        } else {
            "named"
        };
        exports.push(kind.to_string());
    }

    let mut functions = captures(&RE_FUNC, text);
    for name in captures(&RE_ARROW_DECL, text) {
        if !functions.contains(&name) {
            functions.push(name);
        }
    }
    let classes = captures(&RE_CLASS, text);
    let hints = js_hints(path, ext, text, &functions, &classes);

    ParseOutcome {
        imports,
        exports,
        symbols: Symbols { functions, classes },
        hints,
    }
}

/// Top-level imports, functions and classes of a Python module
pub fn parse_python(text: &str) -> ParseOutcome {
    let mut imports = Vec::new();
    for caps in RE_PY_IMPORT.captures_iter(text) {
        let Some(list) = caps.get(1) else { continue };
        for item in list.as_str().split(',') {
            let module = item.split_whitespace().next().unwrap_or("");
            if !module.is_empty() {
                imports.push(ImportRef {
                    raw: module.to_string(),
                    kind: ImportKind::Py,
                });
            }
        }
    }
    for caps in RE_PY_FROM.captures_iter(text) {
        // relative levels are dropped; the module name alone goes to the resolver
        let module = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        imports.push(ImportRef {
            raw: module.to_string(),
            kind: ImportKind::Py,
        });
    }

    let functions = captures(&RE_PY_DEF, text);
    let classes = captures(&RE_PY_CLASS, text);

    let mut hints = Hints::default();
    if imports.iter().any(|i| i.raw == "fastapi") {
        hints.framework = Some("fastapi".to_string());
        if RE_PY_DECORATED_DEF.is_match(text) {
            hints.is_api = true;
            hints.is_route = true;
        }
    }

    ParseOutcome {
        imports,
        exports: Vec::new(),
        symbols: Symbols { functions, classes },
        hints,
    }
}

/// Runs `{command} <absolute path>` per file and reads a [`ParseOutcome`] from stdout
#[derive(Clone)]
pub struct SubprocessParser {
    program: PathBuf,
    args: Vec<String>,
    limiter: SubprocessLimiter,
}

impl SubprocessParser {
    pub fn new(command: Vec<String>, limiter: SubprocessLimiter) -> Result<Self> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or_else(|| {
            AppError::Configuration(
                "analysis.parser_command must name a program when parser = \"subprocess\"".to_string(),
            )
        })?;
        Ok(Self {
            program: PathBuf::from(program),
            args: parts.collect(),
            limiter,
        })
    }
}

#[async_trait]
impl FileParser for SubprocessParser {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn parse(&self, root: &Path, file: &DiscoveredFile) -> Result<ParseOutcome> {
        if !super::discover::is_source_language(&file.language) {
            return Ok(ParseOutcome::default());
        }

        let _permit = self.limiter.acquire().await?;
        let path = root.join(&file.path);

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Infrastructure(format!(
                    "failed to start parser {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let output = match self.limiter.with_file_timeout(child.wait_with_output()).await {
            Some(output) => output?,
            None => {
                return Err(AppError::exhausted(
                    ResourceLimit::Timeout,
                    format!("{} took longer than {:?}", file.path, self.limiter.file_timeout),
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Internal(format!(
                "parser exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Repo-wide signals applied to every parsed file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectContext {
    pub nextjs: bool,
}

impl ProjectContext {
    pub fn detect(root: &Path) -> Self {
        let mut nextjs = false;
        if let Ok(text) = std::fs::read_to_string(root.join("package.json")) {
            if let Ok(package) = serde_json::from_str::<serde_json::Value>(&text) {
                nextjs = ["dependencies", "devDependencies", "peerDependencies"]
                    .iter()
                    .any(|section| package.get(section).and_then(|deps| deps.get("next")).is_some());
            }
        }
        if root.join("src/app").is_dir() || root.join("pages").is_dir() {
            nextjs = true;
        }
        Self { nextjs }
    }

    /// Inherit the framework for JSX files whose own hints do not name one
    pub fn apply(&self, ext: &str, hints: &mut Hints) {
        if self.nextjs && hints.framework.is_none() && (ext == ".tsx" || ext == ".jsx") {
            hints.framework = Some("nextjs".to_string());
        }
    }
}
