use crate::error::Result;
#[cfg(test)]
use crate::error::AppError;
use crate::metrics::MetricsConfig;
use crate::models::TaskKind;
use crate::queue::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use validator::Validate;

/// Flat operational variables and the config keys they override.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("NODE_SUBPROC_CONCURRENCY", "limits.node_subproc_concurrency"),
    ("NODE_FILE_TIMEOUT_S", "limits.node_file_timeout_s"),
    ("NODE_BATCH_TIMEOUT_S", "limits.node_batch_timeout_s"),
    ("LLM_TPM", "limits.llm_tpm"),
    ("LLM_RPM", "limits.llm_rpm"),
    ("MAX_UPLOAD_BYTES", "ingest.max_upload_bytes"),
    ("ZIP_MAX_ENTRIES", "ingest.zip_max_entries"),
    ("ZIP_MAX_DEPTH", "ingest.zip_max_depth"),
    ("ZIP_MAX_UNCOMPRESSED_BYTES", "ingest.zip_max_uncompressed_bytes"),
    ("ZIP_MAX_RATIO", "ingest.zip_max_ratio"),
    ("PARSE_BATCH_SIZE", "analysis.parse_batch_size"),
    ("DATA_DIR", "storage.data_dir"),
    ("REDIS_URL", "queue.redis_url"),
    ("LLM_BASE_URL", "llm.base_url"),
    ("LLM_MODEL", "llm.model"),
    ("LLM_API_KEY", "llm.api_key"),
    ("PORT", "server.port"),
];

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueConfig,

    #[serde(default)]
    #[validate(nested)]
    pub limits: LimitsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ingest: IngestConfig,

    #[serde(default)]
    #[validate(nested)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from embedded defaults, an optional file, and the environment
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("PROVIS_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name(&config_path).required(false))
            // PROVIS__SECTION__KEY
            .add_source(
                config::Environment::with_prefix("PROVIS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        for (var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, std::env::var(var).ok())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document layered over the embedded defaults, without touching the environment
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Retry policy for a task kind, falling back to the built-in table
    pub fn retry_policy(&self, kind: TaskKind) -> RetryPolicy {
        self.queue
            .retry
            .get(kind.as_ref())
            .cloned()
            .unwrap_or_else(|| RetryPolicy::for_kind(kind))
    }

    /// Configuration suited to tests: in-memory backends, no backoff delay
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.storage.data_dir = data_dir.into();
        config.storage.backend = StorageBackend::Memory;
        config.state.backend = StateBackend::Memory;
        config.queue.backoff_scale = 0.0;
        config.queue.dequeue_timeout_ms = 50;
        config.server.workers = 2;
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of pipeline workers started alongside the API
    #[serde(default = "default_workers")]
    #[validate(range(min = 1, max = 256))]
    pub workers: usize,

    /// Interval between SSE keepalive comments
    #[serde(default = "default_keepalive")]
    #[validate(range(min = 1))]
    pub sse_keepalive_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            sse_keepalive_secs: default_keepalive(),
        }
    }
}

/// Backend for the job/task ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    Memory,
    #[default]
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,

    /// Ledger path for the sled backend, relative paths resolve against the working dir
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::default(),
            path: default_state_path(),
        }
    }
}

/// Backend for versioned artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Fs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root for uploads and extracted snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root for the artifact tree, defaults to `{data_dir}/artifacts`
    #[serde(default)]
    pub artifact_root: Option<PathBuf>,
}

impl StorageConfig {
    pub fn artifact_root(&self) -> PathBuf {
        self.artifact_root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("artifacts"))
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: default_data_dir(),
            artifact_root: None,
        }
    }
}

/// Backend for the priority task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for the per-lane Redis lists
    #[serde(default = "default_queue_prefix")]
    pub key_prefix: String,

    /// Multiplier applied to every retry backoff, 0 disables waiting
    #[serde(default = "default_backoff_scale")]
    #[validate(range(min = 0.0))]
    pub backoff_scale: f64,

    /// How long an idle worker blocks on an empty queue before polling again
    #[serde(default = "default_dequeue_timeout_ms")]
    #[validate(range(min = 1))]
    pub dequeue_timeout_ms: u64,

    /// Per-task retry overrides keyed by task name
    #[serde(default)]
    pub retry: HashMap<String, RetryPolicy>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_queue_prefix(),
            backoff_scale: default_backoff_scale(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            retry: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LimitsConfig {
    /// Concurrent parser subprocesses
    #[serde(default = "default_subproc_concurrency")]
    #[validate(range(min = 1))]
    pub node_subproc_concurrency: usize,

    /// Per-file parse timeout
    #[serde(default = "default_file_timeout")]
    #[validate(range(min = 1))]
    pub node_file_timeout_s: u64,

    /// Whole-batch parse timeout
    #[serde(default = "default_batch_timeout")]
    #[validate(range(min = 1))]
    pub node_batch_timeout_s: u64,

    /// LLM tokens per minute
    #[serde(default = "default_llm_tpm")]
    #[validate(range(min = 1))]
    pub llm_tpm: u64,

    /// LLM requests per minute
    #[serde(default = "default_llm_rpm")]
    #[validate(range(min = 1))]
    pub llm_rpm: u64,

    /// Longest a caller waits on a rate limiter or the subprocess semaphore
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_s: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            node_subproc_concurrency: default_subproc_concurrency(),
            node_file_timeout_s: default_file_timeout(),
            node_batch_timeout_s: default_batch_timeout(),
            llm_tpm: default_llm_tpm(),
            llm_rpm: default_llm_rpm(),
            acquire_timeout_s: default_acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IngestConfig {
    #[serde(default = "default_max_upload")]
    #[validate(range(min = 1))]
    pub max_upload_bytes: u64,

    #[serde(default = "default_zip_max_entries")]
    #[validate(range(min = 1))]
    pub zip_max_entries: usize,

    #[serde(default = "default_zip_max_depth")]
    #[validate(range(min = 1))]
    pub zip_max_depth: usize,

    #[serde(default = "default_zip_max_uncompressed")]
    #[validate(range(min = 1))]
    pub zip_max_uncompressed_bytes: u64,

    #[serde(default = "default_zip_max_ratio")]
    #[validate(range(min = 1.0))]
    pub zip_max_ratio: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload(),
            zip_max_entries: default_zip_max_entries(),
            zip_max_depth: default_zip_max_depth(),
            zip_max_uncompressed_bytes: default_zip_max_uncompressed(),
            zip_max_ratio: default_zip_max_ratio(),
        }
    }
}

/// Which parser handles source files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserMode {
    #[default]
    Heuristic,
    Subprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AnalysisConfig {
    /// Files per parse batch
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub parse_batch_size: usize,

    #[serde(default = "default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,

    #[serde(default = "default_ignored_exts")]
    pub ignored_exts: Vec<String>,

    /// Files above this size are listed but not parsed
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    #[serde(default)]
    pub parser: ParserMode,

    /// Program and leading arguments for the subprocess parser, the file path is appended
    #[serde(default)]
    pub parser_command: Vec<String>,

    /// Upper bound on files summarized through the LLM per job
    #[serde(default = "default_summary_budget")]
    pub summary_file_budget: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            parse_batch_size: default_batch_size(),
            ignored_dirs: default_ignored_dirs(),
            ignored_exts: default_ignored_exts(),
            max_file_bytes: default_max_file_bytes(),
            parser: ParserMode::default(),
            parser_command: Vec::new(),
            summary_file_budget: default_summary_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Without a key the heuristic summarizer is used
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_workers() -> usize {
    4
}

fn default_keepalive() -> u64 {
    30
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/ledger")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_queue_prefix() -> String {
    "provis:queue".to_string()
}

fn default_backoff_scale() -> f64 {
    1.0
}

fn default_dequeue_timeout_ms() -> u64 {
    1000
}

fn default_subproc_concurrency() -> usize {
    2
}

fn default_file_timeout() -> u64 {
    20
}

fn default_batch_timeout() -> u64 {
    120
}

fn default_llm_tpm() -> u64 {
    10_000
}

fn default_llm_rpm() -> u64 {
    100
}

fn default_acquire_timeout() -> u64 {
    60
}

fn default_max_upload() -> u64 {
    100 * 1024 * 1024
}

fn default_zip_max_entries() -> usize {
    60_000
}

fn default_zip_max_depth() -> usize {
    20
}

fn default_zip_max_uncompressed() -> u64 {
    1024 * 1024 * 1024
}

fn default_zip_max_ratio() -> f64 {
    200.0
}

fn default_batch_size() -> usize {
    50
}

fn default_ignored_dirs() -> Vec<String> {
    [".git", "node_modules", ".next", "dist", "build", ".venv", "__pycache__"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_ignored_exts() -> Vec<String> {
    [
        ".png", ".jpg", ".jpeg", ".gif", ".bmp", ".ico", ".lock", ".pdf", ".mp4", ".mp3", ".mov",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_summary_budget() -> usize {
    100
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_max_tokens() -> u32 {
    800
}

fn default_llm_temperature() -> f32 {
    0.2
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "provis_pipeline=info,tower_http=info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.limits.node_subproc_concurrency, 2);
        assert_eq!(config.limits.node_file_timeout_s, 20);
        assert_eq!(config.limits.node_batch_timeout_s, 120);
        assert_eq!(config.limits.llm_tpm, 10_000);
        assert_eq!(config.limits.llm_rpm, 100);
        assert_eq!(config.ingest.zip_max_entries, 60_000);
        assert_eq!(config.ingest.zip_max_depth, 20);
        assert_eq!(config.ingest.zip_max_uncompressed_bytes, 1 << 30);
        assert_eq!(config.ingest.zip_max_ratio, 200.0);
        assert_eq!(config.analysis.parse_batch_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.state.backend, StateBackend::Sled);
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.storage.artifact_root(), PathBuf::from("data/artifacts"));
    }

    #[test]
    fn test_toml_override_and_retry_table() {
        let config = Config::from_toml(
            r#"
            [analysis]
            parse_batch_size = 10

            [queue.retry.summarize]
            max_attempts = 5
            backoff_secs = [1, 2]
            "#,
        )
        .unwrap();
        assert_eq!(config.analysis.parse_batch_size, 10);
        assert_eq!(config.retry_policy(TaskKind::Summarize).max_attempts, 5);
        assert_eq!(config.retry_policy(TaskKind::Ingest).max_attempts, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = Config::from_toml(
            r#"
            [analysis]
            parse_batch_size = 0
            "#,
        );
        assert!(matches!(result, Err(AppError::Configuration(_))));
    }
}
