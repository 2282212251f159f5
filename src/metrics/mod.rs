/// Prometheus metrics for the analysis pipeline.
///
/// Covers the HTTP surface, job and task outcomes, queue depth per lane,
/// artifact writes, LLM usage and rate limiting, and parser throughput.
///
/// # Example
/// ```no_run
/// use provis_pipeline::metrics::TASKS_TOTAL;
///
/// TASKS_TOTAL
///     .with_label_values(&["parse_batch", "succeeded"])
///     .inc();
/// ```

mod collectors;
mod config;
mod middleware;

pub use collectors::*;
pub use config::MetricsConfig;
pub use middleware::{MetricsLayer, MetricsService};

use lazy_static::lazy_static;
use prometheus::{
    core::Collector, Counter, CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry,
};

const NAMESPACE: &str = "provis";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // HTTP Metrics
    // ============================================================================

    /// Labels: method, path, status_code
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests")
            .namespace(NAMESPACE),
        &["method", "path", "status_code"]
    ).expect("Failed to create HTTP_REQUESTS_TOTAL metric");

    /// Labels: method, path
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create HTTP_REQUEST_DURATION_SECONDS metric");

    /// Number of in-flight HTTP requests
    pub static ref HTTP_CONNECTIONS_ACTIVE: Gauge = Gauge::with_opts(
        Opts::new("http_connections_active", "Number of in-flight HTTP requests")
            .namespace(NAMESPACE)
    ).expect("Failed to create HTTP_CONNECTIONS_ACTIVE metric");

    /// Open server-sent event streams
    pub static ref SSE_STREAMS_ACTIVE: Gauge = Gauge::with_opts(
        Opts::new("sse_streams_active", "Open job event streams")
            .namespace(NAMESPACE)
    ).expect("Failed to create SSE_STREAMS_ACTIVE metric");

    // ============================================================================
    // Job & Task Metrics
    // ============================================================================

    /// Labels: outcome (submitted, done, failed, cancelled)
    pub static ref JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("jobs_total", "Jobs by outcome")
            .namespace(NAMESPACE),
        &["outcome"]
    ).expect("Failed to create JOBS_TOTAL metric");

    /// Submission to terminal phase. Labels: outcome
    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("job_duration_seconds", "Job duration in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["outcome"]
    ).expect("Failed to create JOB_DURATION_SECONDS metric");

    /// Labels: task, status (succeeded, retried, failed)
    pub static ref TASKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tasks_total", "Task executions by outcome")
            .namespace(NAMESPACE),
        &["task", "status"]
    ).expect("Failed to create TASKS_TOTAL metric");

    /// Labels: task
    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("task_duration_seconds", "Task duration in seconds, retries included")
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["task"]
    ).expect("Failed to create TASK_DURATION_SECONDS metric");

    /// Labels: task
    pub static ref TASK_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("task_retries_total", "Task attempts beyond the first")
            .namespace(NAMESPACE),
        &["task"]
    ).expect("Failed to create TASK_RETRIES_TOTAL metric");

    /// Labels: lane
    pub static ref QUEUE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new("queue_depth", "Queued tasks per priority lane")
            .namespace(NAMESPACE),
        &["lane"]
    ).expect("Failed to create QUEUE_DEPTH metric");

    /// Labels: type
    pub static ref EVENTS_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("events_published_total", "Job events appended to the log")
            .namespace(NAMESPACE),
        &["type"]
    ).expect("Failed to create EVENTS_PUBLISHED_TOTAL metric");

    // ============================================================================
    // Ingest & Artifact Metrics
    // ============================================================================

    /// Uploads that matched an existing snapshot
    pub static ref CACHE_HITS_TOTAL: Counter = Counter::with_opts(
        Opts::new("cache_hits_total", "Uploads matching an existing snapshot")
            .namespace(NAMESPACE)
    ).expect("Failed to create CACHE_HITS_TOTAL metric");

    /// Labels: code
    pub static ref UPLOADS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("uploads_rejected_total", "Uploads rejected by validation")
            .namespace(NAMESPACE),
        &["code"]
    ).expect("Failed to create UPLOADS_REJECTED_TOTAL metric");

    /// Labels: kind
    pub static ref ARTIFACTS_WRITTEN_TOTAL: CounterVec = CounterVec::new(
        Opts::new("artifacts_written_total", "Artifact versions written")
            .namespace(NAMESPACE),
        &["kind"]
    ).expect("Failed to create ARTIFACTS_WRITTEN_TOTAL metric");

    /// Labels: kind
    pub static ref ARTIFACT_BYTES: HistogramVec = HistogramVec::new(
        HistogramOpts::new("artifact_bytes", "Size of written artifacts in bytes")
            .namespace(NAMESPACE)
            .buckets(prometheus::exponential_buckets(256.0, 4.0, 10).expect("valid buckets")),
        &["kind"]
    ).expect("Failed to create ARTIFACT_BYTES metric");

    // ============================================================================
    // Analysis Metrics
    // ============================================================================

    /// Labels: language, outcome (parsed, skipped, timeout, error)
    pub static ref FILES_PARSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("files_parsed_total", "Source files handled by the parser")
            .namespace(NAMESPACE),
        &["language", "outcome"]
    ).expect("Failed to create FILES_PARSED_TOTAL metric");

    /// Labels: scope (internal, external)
    pub static ref IMPORTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("imports_total", "Resolved imports by scope")
            .namespace(NAMESPACE),
        &["scope"]
    ).expect("Failed to create IMPORTS_TOTAL metric");

    // ============================================================================
    // LLM Metrics
    // ============================================================================

    /// Labels: outcome (success, error, fallback)
    pub static ref LLM_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("llm_requests_total", "Summarizer LLM requests")
            .namespace(NAMESPACE),
        &["outcome"]
    ).expect("Failed to create LLM_REQUESTS_TOTAL metric");

    /// Estimated tokens charged against the TPM budget
    pub static ref LLM_TOKENS_TOTAL: Counter = Counter::with_opts(
        Opts::new("llm_tokens_total", "Estimated LLM tokens consumed")
            .namespace(NAMESPACE)
    ).expect("Failed to create LLM_TOKENS_TOTAL metric");

    /// Labels: limiter (tpm, rpm, subprocess)
    pub static ref RATE_LIMIT_REJECTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("rate_limit_rejections_total", "Acquisitions that timed out")
            .namespace(NAMESPACE),
        &["limiter"]
    ).expect("Failed to create RATE_LIMIT_REJECTIONS_TOTAL metric");

    // ============================================================================
    // Error & System Metrics
    // ============================================================================

    /// Labels: component, error_type
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("errors_total", "Total number of errors")
            .namespace(NAMESPACE),
        &["component", "error_type"]
    ).expect("Failed to create ERRORS_TOTAL metric");

    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Application build information")
            .namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");

    pub static ref UPTIME_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("uptime_seconds", "Application uptime in seconds")
            .namespace(NAMESPACE)
    ).expect("Failed to create UPTIME_SECONDS metric");
}

fn register<C: Collector + Clone + 'static>(collector: &C) -> Result<(), prometheus::Error> {
    match PROMETHEUS_REGISTRY.register(Box::new(collector.clone())) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Register every metric with the global registry.
///
/// Safe to call more than once; metrics already registered are skipped.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    // HTTP
    register(&*HTTP_REQUESTS_TOTAL)?;
    register(&*HTTP_REQUEST_DURATION_SECONDS)?;
    register(&*HTTP_CONNECTIONS_ACTIVE)?;
    register(&*SSE_STREAMS_ACTIVE)?;

    // Jobs and tasks
    register(&*JOBS_TOTAL)?;
    register(&*JOB_DURATION_SECONDS)?;
    register(&*TASKS_TOTAL)?;
    register(&*TASK_DURATION_SECONDS)?;
    register(&*TASK_RETRIES_TOTAL)?;
    register(&*QUEUE_DEPTH)?;
    register(&*EVENTS_PUBLISHED_TOTAL)?;

    // Ingest and artifacts
    register(&*CACHE_HITS_TOTAL)?;
    register(&*UPLOADS_REJECTED_TOTAL)?;
    register(&*ARTIFACTS_WRITTEN_TOTAL)?;
    register(&*ARTIFACT_BYTES)?;

    // Analysis
    register(&*FILES_PARSED_TOTAL)?;
    register(&*IMPORTS_TOTAL)?;

    // LLM
    register(&*LLM_REQUESTS_TOTAL)?;
    register(&*LLM_TOKENS_TOTAL)?;
    register(&*RATE_LIMIT_REJECTIONS_TOTAL)?;

    // Errors and system
    register(&*ERRORS_TOTAL)?;
    register(&*BUILD_INFO)?;
    register(&*UPTIME_SECONDS)?;

    BUILD_INFO
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Render the registry in the Prometheus text exposition format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}
