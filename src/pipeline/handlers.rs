//! One handler per task kind. Each reads its inputs from the ledger and the
//! artifact store, writes its outputs, and returns the JSON stored on the task.

use super::orchestrator::Orchestrator;
use crate::analysis::{
    build_capabilities, build_graph, discover, merge_batches, parse_batch, summarize_files,
    tree_payload, BatchOutput, FilesPayload, GraphPayload, TreePayload,
};
use crate::artifacts::{get_latest_json, put_json};
use crate::error::{AppError, Result};
use crate::ingest::{extract_snapshot, load_upload, upload_path};
use crate::models::{
    ArtifactKind, EventPayload, Job, Snapshot, SnapshotStatus, Task, TaskKind, TaskState,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Run the work of `task` and return its output
pub async fn execute(orch: &Orchestrator, task: &Task) -> Result<Value> {
    let job = orch
        .context()
        .ledger
        .get_job(&task.job_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Job {} not found", task.job_id)))?;

    match task.kind {
        TaskKind::Ingest => ingest(orch, &job).await,
        TaskKind::Discover => discover_files(orch, &job, task).await,
        TaskKind::ParseBatch => parse(orch, &job, task).await,
        TaskKind::Merge => merge(orch, &job, task).await,
        TaskKind::Map => map(orch, &job, task).await,
        TaskKind::Summarize => summarize(orch, &job, task).await,
        TaskKind::Finalize => finalize(orch, &job, task).await,
    }
}

/// Store `value` as the next version of `kind` and announce it
async fn write_artifact<T: Serialize + ?Sized>(
    orch: &Orchestrator,
    job: &Job,
    task: &Task,
    kind: ArtifactKind,
    value: &T,
) -> Result<()> {
    let ctx = orch.context();
    let key = ctx.artifact_key(job, kind);
    let record = put_json(ctx.artifacts.as_ref(), &key, value, Some(&task.idempotency_key)).await?;
    orch.artifact_ready(job.id, &record).await
}

async fn snapshot_of(orch: &Orchestrator, job: &Job) -> Result<Snapshot> {
    orch.context()
        .ledger
        .latest_snapshot_for_repo(&job.repo_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Snapshot for repo {} not found", job.repo_id)))
}

async fn ingest(orch: &Orchestrator, job: &Job) -> Result<Value> {
    let ctx = orch.context();
    let mut snapshot = snapshot_of(orch, job).await?;
    let root = ctx.snapshot_root(snapshot.commit_hash());

    if snapshot.status == SnapshotStatus::Ready && root.exists() {
        debug!(job_id = %job.id, snapshot_id = %snapshot.id, "Snapshot already extracted");
        return Ok(json!({ "extracted": false, "snapshotId": snapshot.id }));
    }

    let uploads_dir = ctx.uploads_dir();
    let bytes = load_upload(&uploads_dir, &job.id).await?;
    let guard = ctx.guard.clone();
    let snapshots_dir = ctx.snapshots_dir();
    let commit = snapshot.commit_hash().to_string();
    let extracted = tokio::task::spawn_blocking(move || {
        extract_snapshot(&guard, &bytes, &snapshots_dir, &commit)
    })
    .await
    .map_err(|e| AppError::Internal(format!("extraction panicked: {}", e)))??;

    snapshot.status = SnapshotStatus::Ready;
    ctx.ledger.update_snapshot(&snapshot).await?;

    if let Err(e) = tokio::fs::remove_file(upload_path(&uploads_dir, &job.id)).await {
        warn!(job_id = %job.id, error = %e, "Failed to remove stored upload");
    }

    info!(
        job_id = %job.id,
        snapshot_id = %snapshot.id,
        files = snapshot.file_count,
        extracted,
        "Snapshot ready"
    );
    Ok(json!({ "extracted": extracted, "snapshotId": snapshot.id }))
}

async fn discover_files(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let ctx = orch.context();
    let root = ctx.snapshot_root(&job.snapshot_id);
    let analysis = ctx.config.analysis.clone();
    let files = tokio::task::spawn_blocking(move || discover(&root, &analysis))
        .await
        .map_err(|e| AppError::Internal(format!("discovery panicked: {}", e)))??;

    let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
    orch.emit(job.id, EventPayload::FilesTotal { count: paths.len() })
        .await?;

    let tree = tree_payload(&job.repo_id, files);
    write_artifact(orch, job, task, ArtifactKind::Tree, &tree).await?;

    info!(job_id = %job.id, files = paths.len(), languages = tree.languages.len(), "Discovery complete");
    Ok(json!({ "fileCount": paths.len(), "paths": paths }))
}

async fn parse(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let ctx = orch.context();
    let batch = task
        .batch
        .as_ref()
        .ok_or_else(|| AppError::Internal(format!("task {} has no batch", task.idempotency_key)))?;

    let (_, tree): (_, TreePayload) =
        get_latest_json(ctx.artifacts.as_ref(), &ctx.artifact_key(job, ArtifactKind::Tree)).await?;
    let by_path: HashMap<&str, _> = tree.files.iter().map(|f| (f.path.as_str(), f)).collect();
    let metas: Vec<_> = batch
        .files
        .iter()
        .filter_map(|path| by_path.get(path.as_str()).map(|meta| (*meta).clone()))
        .collect();
    if metas.len() < batch.files.len() {
        warn!(
            job_id = %job.id,
            batch = batch.index,
            missing = batch.files.len() - metas.len(),
            "Batch lists files absent from the tree"
        );
    }

    let root = ctx.snapshot_root(&job.snapshot_id);
    let output = ctx
        .subprocess
        .with_batch_timeout(
            &task.label(),
            parse_batch(ctx.parser.as_ref(), &root, batch.index, &metas),
        )
        .await?;

    for warning in &output.warnings {
        orch.warn(job.id, warning.clone()).await?;
    }
    orch.emit(
        job.id,
        EventPayload::BatchParsed {
            batch_index: batch.index,
            total_batches: batch.total,
            parsed: output.parsed,
            skipped: output.skipped,
        },
    )
    .await?;

    debug!(
        job_id = %job.id,
        batch = batch.index,
        total = batch.total,
        parsed = output.parsed,
        skipped = output.skipped,
        "Batch parsed"
    );
    Ok(serde_json::to_value(&output)?)
}

async fn merge(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let tasks = orch.context().ledger.list_tasks(&job.id).await?;
    let batches: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.kind == TaskKind::ParseBatch)
        .collect();

    let unfinished: Vec<String> = batches
        .iter()
        .filter(|t| t.state != TaskState::Succeeded)
        .map(|t| t.idempotency_key.clone())
        .collect();
    if batches.is_empty() || !unfinished.is_empty() {
        return Err(AppError::PartialFailure {
            failed_batches: unfinished,
        });
    }

    let mut outputs = Vec::with_capacity(batches.len());
    for batch in batches {
        let output: BatchOutput = batch
            .output
            .clone()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        outputs.push(output);
    }

    let files = merge_batches(&job.repo_id, outputs);
    write_artifact(orch, job, task, ArtifactKind::Files, &files).await?;

    info!(job_id = %job.id, files = files.summary.total_files, warnings = files.warnings.len(), "Files merged");
    Ok(json!({ "files": files.summary.total_files, "warnings": files.warnings.len() }))
}

async fn map(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let ctx = orch.context();
    let (_, files): (_, FilesPayload) =
        get_latest_json(ctx.artifacts.as_ref(), &ctx.artifact_key(job, ArtifactKind::Files)).await?;

    let (graph, imports) = build_graph(&files);
    write_artifact(orch, job, task, ArtifactKind::Graph, &graph).await?;
    orch.emit(
        job.id,
        EventPayload::ImportsMetrics {
            total: imports.total,
            internal: imports.internal,
            external: imports.external,
        },
    )
    .await?;

    info!(
        job_id = %job.id,
        nodes = graph.metrics.num_nodes,
        edges = graph.metrics.num_edges,
        "Import graph built"
    );
    Ok(json!({
        "nodes": graph.metrics.num_nodes,
        "edges": graph.metrics.num_edges,
        "imports": { "total": imports.total, "internal": imports.internal, "external": imports.external },
    }))
}

async fn summarize(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let ctx = orch.context();
    let (_, files): (_, FilesPayload) =
        get_latest_json(ctx.artifacts.as_ref(), &ctx.artifact_key(job, ArtifactKind::Files)).await?;
    let (_, graph): (_, GraphPayload) =
        get_latest_json(ctx.artifacts.as_ref(), &ctx.artifact_key(job, ArtifactKind::Graph)).await?;

    let (summaries, warnings) = summarize_files(
        ctx.summarizer.as_ref(),
        &files,
        &graph,
        ctx.config.analysis.summary_file_budget,
    )
    .await?;
    for warning in warnings {
        orch.warn(job.id, warning).await?;
    }
    write_artifact(orch, job, task, ArtifactKind::Summaries, &summaries).await?;

    let capabilities = build_capabilities(&files, &graph);
    write_artifact(orch, job, task, ArtifactKind::Capabilities, &capabilities).await?;

    info!(
        job_id = %job.id,
        summarizer = %summaries.summarizer,
        summaries = summaries.files.len(),
        capabilities = capabilities.capabilities.len(),
        "Summaries written"
    );
    Ok(json!({
        "summaries": summaries.files.len(),
        "capabilities": capabilities.capabilities.len(),
    }))
}

async fn finalize(orch: &Orchestrator, job: &Job, task: &Task) -> Result<Value> {
    let completed_at = Utc::now();
    let metrics = json!({
        "jobId": job.id,
        "repoId": job.repo_id,
        "snapshotId": job.snapshot_id,
        "settingsHash": job.settings_hash,
        "completedAt": completed_at,
        "totalMs": (completed_at - job.created_at).num_milliseconds().max(0),
        "phaseDurationsMs": job.phase_durations_ms(completed_at),
        "cacheHit": job.cache_hit,
    });
    write_artifact(orch, job, task, ArtifactKind::Metrics, &metrics).await?;
    Ok(metrics)
}
