use crate::api::{handlers, sse, AppState};
use crate::metrics::MetricsLayer;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Multipart framing allowance on top of the upload limit
const BODY_SLACK_BYTES: u64 = 64 * 1024;

/// Build the main API router
pub fn build_router(state: AppState) -> Router {
    let config = state.context().config.clone();
    let body_limit = config.ingest.max_upload_bytes.saturating_add(BODY_SLACK_BYTES) as usize;

    Router::new()
        // Health and metrics
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        // Upload
        .route("/ingest", post(handlers::ingest))
        // Jobs
        .route("/status/:job_id", get(handlers::get_status))
        .route("/jobs/:job_id", get(handlers::get_job))
        .route("/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/jobs/:job_id/events", get(sse::job_events))
        // Artifacts
        .route(
            "/repos/:repo_id/snapshots/:snapshot_id/artifacts",
            get(handlers::list_artifacts),
        )
        .route("/repo/:repo_id/:kind", get(handlers::get_repo_artifact))
        // Add state
        .with_state(state)
        // Add middleware
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(MetricsLayer::new(config.metrics.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
}
