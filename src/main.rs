use provis_pipeline::{
    api::{build_router, AppState},
    config::{Config, LogFormat},
    metrics::{QueueCollector, RuntimeCollector},
    pipeline::{Orchestrator, PipelineContext, WorkerPool},
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes first so logging can follow it
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };
    init_tracing(&config);

    tracing::info!("Starting Provis pipeline v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        state = ?config.state.backend,
        storage = ?config.storage.backend,
        queue = ?config.queue.backend,
        "Backends selected"
    );

    // Initialize Prometheus metrics
    if config.metrics.enabled {
        if let Err(e) = provis_pipeline::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
            tracing::warn!("Continuing without metrics");
        } else {
            tracing::info!("✅ Prometheus metrics initialized");
        }
    } else {
        tracing::info!("⚠️  Prometheus metrics disabled in configuration");
    }

    let ctx = Arc::new(PipelineContext::from_config(config.clone()).await?);
    tracing::info!("✅ Ledger, artifact store and queue initialized");

    let orchestrator = Arc::new(Orchestrator::new(ctx.clone()));
    let report = orchestrator.recover().await?;
    tracing::info!(
        jobs = report.jobs_resumed,
        tasks = report.tasks_requeued,
        "✅ Recovery finished"
    );

    let workers = WorkerPool::new(orchestrator.clone(), config.server.workers);
    workers.start().await?;

    if config.metrics.enabled {
        let interval = config.metrics.queue_sample_interval_secs;
        Arc::new(RuntimeCollector::new()).start_periodic_collection(interval);
        Arc::new(QueueCollector::new(ctx.queue.clone())).start_periodic_collection(interval);
        tracing::info!("✅ Metric collectors started");
    }

    let app = build_router(AppState::new(orchestrator));

    let http_addr = format!("{}:{}", config.server.host, config.server.port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;

    tracing::info!("🚀 HTTP API server listening on http://{}", http_addr);
    tracing::info!("   Health check: http://{}/health", http_addr);
    tracing::info!("   Upload: POST http://{}/ingest", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = http_handle => {
            tracing::warn!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shutting down gracefully...");
    if let Err(e) = workers.stop().await {
        tracing::warn!("Worker pool shutdown: {}", e);
    }
    Ok(())
}
