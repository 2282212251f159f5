use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::ingest::zip_guard::UPLOAD_TOO_LARGE;
use crate::models::{ArtifactKey, ArtifactKind, ArtifactSummary, Job, JobStatus, Task};
use crate::pipeline::Submission;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Accept a zipped repository and start a job for it
pub async fn ingest(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Submission>)> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() == Some("file") || field.file_name().is_some() {
            let bytes = field.bytes().await.map_err(multipart_error)?;
            upload = Some(bytes.to_vec());
            break;
        }
    }

    let bytes = upload.ok_or_else(|| {
        AppError::validation("missing_file", "multipart field 'file' is required")
    })?;
    if bytes.is_empty() {
        return Err(AppError::validation("empty_file", "uploaded file is empty"));
    }

    let submission = state.orchestrator.submit_job(bytes).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::validation(UPLOAD_TOO_LARGE, err.body_text())
    } else {
        AppError::validation("invalid_multipart", err.body_text())
    }
}

/// Current phase and percentage of a job
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatus>> {
    state
        .context()
        .bus
        .overlay()
        .get(&job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub tasks: Vec<Task>,
}

/// Job row plus its tasks, without task outputs
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobDetailResponse>> {
    let ledger = &state.context().ledger;
    let job = ledger
        .get_job(&job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", job_id)))?;
    let tasks = ledger
        .list_tasks(&job_id)
        .await?
        .into_iter()
        .map(|mut task| {
            task.output = None;
            task
        })
        .collect();
    Ok(Json(JobDetailResponse { job, tasks }))
}

/// Request cancellation of a running job
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<(StatusCode, Json<JobStatus>)> {
    let job = state.orchestrator.cancel_job(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job.status())))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactListResponse {
    pub repo_id: String,
    pub snapshot_id: String,
    pub artifacts: Vec<ArtifactSummary>,
}

/// Every artifact kind and version stored for a snapshot
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path((repo_id, snapshot_id)): Path<(String, String)>,
) -> Result<Json<ArtifactListResponse>> {
    let artifacts = state.context().artifacts.list(&repo_id, &snapshot_id).await?;
    Ok(Json(ArtifactListResponse {
        repo_id,
        snapshot_id,
        artifacts,
    }))
}

/// Latest payload of one kind for the repo's latest snapshot under the current settings
pub async fn get_repo_artifact(
    State(state): State<AppState>,
    Path((repo_id, kind)): Path<(String, String)>,
) -> Result<Response> {
    let kind: ArtifactKind = kind
        .parse()
        .map_err(|_| AppError::NotFound(format!("Unknown artifact kind '{}'", kind)))?;

    let ctx = state.context();
    let snapshot = ctx
        .ledger
        .latest_snapshot_for_repo(&repo_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Repo {} not found", repo_id)))?;

    let key = ArtifactKey::new(&repo_id, snapshot.commit_hash(), &ctx.settings_hash, kind);
    let (record, payload) = ctx.artifacts.get_latest(&key).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::ETAG, format!("\"{}\"", record.sha256)),
        ],
        payload,
    )
        .into_response())
}

/// Prometheus metrics endpoint
///
/// Returns metrics in Prometheus text exposition format
pub async fn metrics() -> (StatusCode, String) {
    let metrics = crate::metrics::gather_metrics();
    (StatusCode::OK, metrics)
}
