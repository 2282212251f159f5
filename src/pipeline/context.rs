use crate::analysis::{create_parser, create_summarizer, FileParser, Summarizer};
use crate::artifacts::{create_artifact_store, ArtifactStore};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, StatusOverlay};
use crate::ingest::{ZipGuard, ZipLimits};
use crate::limits::{LlmRateLimiter, SubprocessLimiter};
use crate::models::{AnalysisSettings, ArtifactKey, ArtifactKind, Job};
use crate::queue::{create_queue, TaskQueue};
use crate::state::{create_ledger, Ledger};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything a pipeline component needs, built once at startup
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub settings: AnalysisSettings,
    pub settings_hash: String,
    pub ledger: Arc<dyn Ledger>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub bus: Arc<EventBus>,
    pub guard: ZipGuard,
    pub subprocess: SubprocessLimiter,
    pub llm_limiter: Arc<LlmRateLimiter>,
    pub parser: Arc<dyn FileParser>,
    pub summarizer: Arc<dyn Summarizer>,
}

impl PipelineContext {
    /// Build every backend named by the configuration
    pub async fn from_config(config: Config) -> Result<Self> {
        let ledger = create_ledger(&config.state)?;
        let artifacts = create_artifact_store(&config.storage)?;
        let queue = create_queue(&config.queue).await?;
        Self::from_parts(config, ledger, artifacts, queue)
    }

    /// Assemble a context around existing backends
    pub fn from_parts(
        config: Config,
        ledger: Arc<dyn Ledger>,
        artifacts: Arc<dyn ArtifactStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Result<Self> {
        let settings = AnalysisSettings::from_config(&config);
        let settings_hash = settings.hash();

        let overlay = Arc::new(StatusOverlay::new(ledger.clone()));
        let bus = Arc::new(EventBus::new(ledger.clone(), overlay));

        let subprocess = SubprocessLimiter::from_config(&config.limits);
        let llm_limiter = Arc::new(LlmRateLimiter::new(
            config.limits.llm_rpm,
            config.limits.llm_tpm,
            Duration::from_secs(config.limits.acquire_timeout_s),
        ));
        let parser = create_parser(&config.analysis, subprocess.clone())?;
        let summarizer = create_summarizer(&config.llm, llm_limiter.clone())?;

        tracing::info!(
            settings_hash = %settings_hash,
            parser = parser.name(),
            summarizer = summarizer.name(),
            "Pipeline context ready"
        );

        Ok(Self {
            guard: ZipGuard::new(ZipLimits::from(&config.ingest)),
            config: Arc::new(config),
            settings,
            settings_hash,
            ledger,
            artifacts,
            queue,
            bus,
            subprocess,
            llm_limiter,
            parser,
            summarizer,
        })
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.config.storage.uploads_dir()
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.config.storage.snapshots_dir()
    }

    /// Extracted files of a snapshot
    pub fn snapshot_root(&self, commit_hash: &str) -> PathBuf {
        crate::ingest::snapshot_dir(&self.snapshots_dir(), commit_hash)
    }

    /// Artifact scope of a job: its snapshot and the settings it was submitted with
    pub fn artifact_key(&self, job: &Job, kind: ArtifactKind) -> ArtifactKey {
        ArtifactKey::new(&job.repo_id, &job.snapshot_id, &job.settings_hash, kind)
    }
}
