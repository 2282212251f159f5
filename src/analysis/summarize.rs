//! Per-file summaries, from an OpenAI-compatible chat endpoint when a key is
//! configured and from parse hints otherwise.

use super::discover::is_source_language;
use super::files::file_blurb;
use super::models::{AnalysisWarning, FileSummary, FilesPayload, GraphPayload, ParsedFile, SummariesPayload, SummarySource};
use crate::config::LlmConfig;
use crate::error::{AppError, ResourceLimit, Result};
use crate::limits::{estimate_tokens, LlmRateLimiter};
use crate::metrics::{LLM_REQUESTS_TOTAL, LLM_TOKENS_TOTAL};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

pub const WARN_LLM_FALLBACK: &str = "llm_fallback";

const SYSTEM_PROMPT: &str = "You summarize one source file for a developer who needs to edit it safely. \
Reply with a JSON object with the fields title, purpose, blurb and key_functions. No code.";

/// Dependencies of a file as resolved by the graph
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileContext {
    pub internal_dependencies: Vec<String>,
    pub external_dependencies: Vec<String>,
}

impl FileContext {
    pub fn from_graph(graph: &GraphPayload, path: &str) -> Self {
        Self {
            internal_dependencies: graph.internal_deps(path),
            external_dependencies: graph.external_deps(path),
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn summarize(&self, file: &ParsedFile, context: &FileContext) -> Result<FileSummary>;
}

/// LLM summarizer when `llm.api_key` is set, heuristic otherwise
pub fn create_summarizer(config: &LlmConfig, limiter: Arc<LlmRateLimiter>) -> Result<Arc<dyn Summarizer>> {
    if config.api_key.is_some() {
        Ok(Arc::new(LlmSummarizer::new(config.clone(), limiter)?))
    } else {
        Ok(Arc::new(HeuristicSummarizer))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicSummarizer;

impl HeuristicSummarizer {
    pub fn describe(&self, file: &ParsedFile, context: &FileContext) -> FileSummary {
        let blurb = if file.blurb.is_empty() {
            file_blurb(file)
        } else {
            file.blurb.clone()
        };
        FileSummary {
            path: file.path.clone(),
            title: file.path.rsplit('/').next().unwrap_or(&file.path).to_string(),
            purpose: Some(format!("A {} {}", file.language, blurb)),
            blurb,
            key_functions: file.symbols.functions.clone(),
            internal_dependencies: context.internal_dependencies.clone(),
            external_dependencies: context.external_dependencies.clone(),
            source: SummarySource::Heuristic,
        }
    }
}

#[async_trait]
impl Summarizer for HeuristicSummarizer {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn summarize(&self, file: &ParsedFile, context: &FileContext) -> Result<FileSummary> {
        Ok(self.describe(file, context))
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct LlmFileReply {
    title: String,
    #[serde(default)]
    purpose: Option<String>,
    blurb: String,
    #[serde(default)]
    key_functions: Vec<serde_json::Value>,
}

/// Chat-completions client guarded by the RPM/TPM limiter
#[derive(Clone)]
pub struct LlmSummarizer {
    client: Client,
    config: LlmConfig,
    limiter: Arc<LlmRateLimiter>,
}

impl LlmSummarizer {
    pub fn new(config: LlmConfig, limiter: Arc<LlmRateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Configuration(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    fn prompt(file: &ParsedFile, context: &FileContext) -> Result<String> {
        Ok(serde_json::to_string(&json!({
            "path": file.path,
            "language": file.language,
            "ext": file.ext,
            "hints": file.hints,
            "symbols": file.symbols,
            "internal_dependencies": context.internal_dependencies,
            "external_dependencies": context.external_dependencies,
        }))?)
    }

    async fn complete(&self, prompt: String) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let messages = vec![
            ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: prompt,
            },
        ];
        let body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::exhausted(
                    ResourceLimit::Timeout,
                    format!("LLM request timed out after {} seconds", self.config.timeout_secs),
                )
            } else {
                AppError::Internal(format!("LLM request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::exhausted(
                ResourceLimit::RateLimited,
                "LLM provider returned 429",
            ));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "LLM provider returned {}: {}",
                status,
                text.chars().take(200).collect::<String>()
            )));
        }

        let reply: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Serialization(format!("invalid LLM response: {}", e)))?;
        if let Some(usage) = &reply.usage {
            LLM_TOKENS_TOTAL.inc_by(usage.total_tokens as f64);
        }
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Serialization("LLM response had no content".to_string()))
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn summarize(&self, file: &ParsedFile, context: &FileContext) -> Result<FileSummary> {
        let prompt = Self::prompt(file, context)?;
        self.limiter
            .acquire(estimate_tokens(&prompt, self.config.max_tokens))
            .await?;

        let content = match self.complete(prompt).await {
            Ok(content) => {
                LLM_REQUESTS_TOTAL.with_label_values(&["ok"]).inc();
                content
            }
            Err(e) => {
                LLM_REQUESTS_TOTAL.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        let reply: LlmFileReply = serde_json::from_str(&content)?;
        Ok(FileSummary {
            path: file.path.clone(),
            title: reply.title,
            purpose: reply.purpose,
            blurb: reply.blurb,
            key_functions: reply
                .key_functions
                .into_iter()
                .map(|v| match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            internal_dependencies: context.internal_dependencies.clone(),
            external_dependencies: context.external_dependencies.clone(),
            source: SummarySource::Llm,
        })
    }
}

/// Summarize every file of the `files` artifact.
///
/// At most `budget` parsed source files go through `summarizer`; the rest, and
/// any file the summarizer fails on, get the heuristic summary plus a warning.
/// Rate limiting is not absorbed: it fails the call so the task is retried.
pub async fn summarize_files(
    summarizer: &dyn Summarizer,
    files: &FilesPayload,
    graph: &GraphPayload,
    budget: usize,
) -> Result<(SummariesPayload, Vec<AnalysisWarning>)> {
    let heuristic = HeuristicSummarizer;
    let mut summaries = Vec::with_capacity(files.files.len());
    let mut warnings = Vec::new();
    let mut remaining = budget;

    for file in &files.files {
        let context = FileContext::from_graph(graph, &file.path);
        let eligible = summarizer.name() != heuristic.name()
            && remaining > 0
            && is_source_language(&file.language)
            && file.warnings.is_empty();

        if !eligible {
            summaries.push(heuristic.describe(file, &context));
            continue;
        }
        remaining -= 1;

        match summarizer.summarize(file, &context).await {
            Ok(summary) => summaries.push(summary),
            Err(e @ AppError::ResourceExhausted { reason: ResourceLimit::RateLimited, .. }) => {
                return Err(e)
            }
            Err(e) => {
                tracing::warn!(file = %file.path, error = %e, "Summarizer failed, using heuristic summary");
                warnings.push(AnalysisWarning::new(
                    WARN_LLM_FALLBACK,
                    format!("Summary for {} fell back to heuristics: {}", file.path, e),
                    Some(&file.path),
                ));
                summaries.push(heuristic.describe(file, &context));
            }
        }
    }

    let payload = SummariesPayload {
        repo_id: files.repo_id.clone(),
        generated_at: Utc::now(),
        summarizer: summarizer.name().to_string(),
        files: summaries,
        warnings: warnings.iter().map(|w| w.message.clone()).collect(),
    };
    Ok((payload, warnings))
}
