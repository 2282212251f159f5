mod common;

use common::{build_zip, event_types, sample_repo, wait_for_terminal, TestPipeline};
use futures::StreamExt;
use provis_pipeline::analysis::GraphPayload;
use provis_pipeline::artifacts::{get_latest_json, InMemoryArtifactStore};
use provis_pipeline::config::{Config, ParserMode, StateBackend};
use provis_pipeline::error::AppError;
use provis_pipeline::events::fold;
use provis_pipeline::models::{
    ArtifactKind, EventPayload, JobPhase, TaskKind, TaskState,
};
use provis_pipeline::pipeline::{handlers, Orchestrator, PipelineContext, WorkerPool};
use provis_pipeline::queue::InMemoryQueue;
use provis_pipeline::state::create_in_memory_ledger;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_three_file_repo_runs_to_done() {
    let pipeline = TestPipeline::start().await;
    let submission = pipeline
        .orchestrator
        .submit_job(sample_repo())
        .await
        .unwrap();
    assert!(!submission.cache_hit);

    let job = pipeline.wait_for_terminal(submission.job_id).await;
    assert_eq!(job.phase, JobPhase::Done);
    assert_eq!(job.pct, 100);
    assert!(job.error.is_none());

    // Phases in lifecycle order, pct never decreasing
    let events = pipeline.events(submission.job_id).await;
    let phases: Vec<JobPhase> = events
        .iter()
        .filter_map(|e| match e.payload {
            EventPayload::Phase { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            JobPhase::Acquiring,
            JobPhase::Discovering,
            JobPhase::Parsing,
            JobPhase::Mapping,
            JobPhase::Summarizing,
        ]
    );

    let mut last_pct = 0;
    for event in &events {
        if let EventPayload::Phase { pct, .. } | EventPayload::Progress { pct, .. } = event.payload {
            assert!(pct >= last_pct, "pct went from {} to {}", last_pct, pct);
            last_pct = pct;
        }
    }
    assert_eq!(event_types(&events).last().map(String::as_str), Some("done"));

    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as u64).collect::<Vec<_>>());

    // Graph v1 with the internal edge resolved
    let ctx = pipeline.ctx();
    let key = ctx.artifact_key(&job, ArtifactKind::Graph);
    let (record, graph): (_, GraphPayload) = get_latest_json(ctx.artifacts.as_ref(), &key)
        .await
        .unwrap();
    assert_eq!(record.version, 1);
    assert!(graph
        .edges
        .iter()
        .any(|e| e.from == "src/index.ts" && e.resolved.as_deref() == Some("src/util.ts")));
    assert!(graph
        .edges
        .iter()
        .any(|e| e.from == "src/index.ts" && e.external && e.to == "express"));

    for kind in [
        ArtifactKind::Tree,
        ArtifactKind::Files,
        ArtifactKind::Summaries,
        ArtifactKind::Capabilities,
        ArtifactKind::Metrics,
    ] {
        let record = ctx
            .artifacts
            .latest_record(&ctx.artifact_key(&job, kind))
            .await
            .unwrap();
        assert_eq!(record.map(|r| r.version), Some(1), "{} missing", kind);
    }

    // The stored upload is removed once extracted
    assert!(!provis_pipeline::ingest::upload_path(&ctx.uploads_dir(), &job.id).exists());
}

#[tokio::test]
async fn test_resubmission_is_a_cache_hit() {
    let pipeline = TestPipeline::start().await;
    let orch = &pipeline.orchestrator;

    let first = orch.submit_job(sample_repo()).await.unwrap();
    pipeline.wait_for_terminal(first.job_id).await;

    let second = orch.submit_job(sample_repo()).await.unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.repo_id, first.repo_id);
    assert_eq!(second.snapshot_id, first.snapshot_id);
    assert_ne!(second.job_id, first.job_id);

    let job = pipeline.wait_for_terminal(second.job_id).await;
    assert_eq!(job.phase, JobPhase::Done);
    assert!(job.cache_hit);

    let types = event_types(&pipeline.events(second.job_id).await);
    assert_eq!(types.first().map(String::as_str), Some("cache_hit"));
    assert_eq!(types.last().map(String::as_str), Some("done"));

    // Only finalize ran for the second job
    let tasks = pipeline.ctx().ledger.list_tasks(&second.job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::Finalize);

    let ctx = pipeline.ctx();
    let graph = ctx
        .artifacts
        .latest_record(&ctx.artifact_key(&job, ArtifactKind::Graph))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(graph.version, 1);
    let metrics = ctx
        .artifacts
        .latest_record(&ctx.artifact_key(&job, ArtifactKind::Metrics))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.version, 2);
}

#[tokio::test]
async fn test_different_content_gets_new_repo() {
    let pipeline = TestPipeline::start().await;
    let a = pipeline.orchestrator.submit_job(sample_repo()).await.unwrap();
    let b = pipeline
        .orchestrator
        .submit_job(build_zip(&[("main.py", "import os\n")]))
        .await
        .unwrap();
    assert_ne!(a.repo_id, b.repo_id);
    assert!(!b.cache_hit);
    pipeline.wait_for_terminal(a.job_id).await;
    assert_eq!(pipeline.wait_for_terminal(b.job_id).await.phase, JobPhase::Done);
}

#[tokio::test]
async fn test_failed_batches_fail_job_once_all_settle() {
    let pipeline = TestPipeline::start_with(|config| {
        config.analysis.parser = ParserMode::Subprocess;
        config.analysis.parser_command = vec!["/nonexistent/provis-parser".to_string()];
        config.analysis.parse_batch_size = 1;
        config.server.workers = 1;
    })
    .await;

    let archive = build_zip(&[
        ("pkg/a.py", "import os\n"),
        ("pkg/b.py", "import sys\n"),
        ("pkg/c.py", "import json\n"),
    ]);
    let submission = pipeline.orchestrator.submit_job(archive).await.unwrap();
    let job = pipeline.wait_for_terminal(submission.job_id).await;
    assert_eq!(job.phase, JobPhase::Failed);
    assert_eq!(job.error_code.as_deref(), Some("batches_failed"));

    // Every batch retried up to the parse_batch limit before the job gave up
    let tasks = pipeline
        .ctx()
        .ledger
        .list_tasks(&submission.job_id)
        .await
        .unwrap();
    let mut batches: Vec<_> = tasks
        .iter()
        .filter(|t| t.kind == TaskKind::ParseBatch)
        .collect();
    batches.sort_by_key(|t| t.batch.as_ref().unwrap().index);
    assert_eq!(batches.len(), 3);
    for batch in &batches {
        assert_eq!(batch.state, TaskState::Failed, "{}", batch.idempotency_key);
        assert_eq!(batch.attempt, 3);
    }
    assert!(tasks.iter().all(|t| t.kind != TaskKind::Merge));

    // Give stray workers a moment, then make sure nothing followed the error
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = pipeline.events(submission.job_id).await;
    let types = event_types(&events);
    assert!(!types.contains(&"done".to_string()));
    assert_eq!(types.iter().filter(|t| t.as_str() == "error").count(), 1);
    assert_eq!(types.last().map(String::as_str), Some("error"));
    match &events.last().unwrap().payload {
        EventPayload::Error { code, context, .. } => {
            assert_eq!(code, "batches_failed");
            let expected: Vec<&str> = batches.iter().map(|t| t.idempotency_key.as_str()).collect();
            let reported: Vec<&str> = context["failedBatches"]
                .as_array()
                .unwrap()
                .iter()
                .map(|k| k.as_str().unwrap())
                .collect();
            assert_eq!(reported, expected);
        }
        other => panic!("unexpected terminal event {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_stops_advancement() {
    let dir = TempDir::new().unwrap();
    let config = Config::for_testing(dir.path());
    let ctx = Arc::new(PipelineContext::from_config(config).await.unwrap());
    let orch = Arc::new(Orchestrator::new(ctx.clone()));

    // No workers yet: the ingest task waits in the queue
    let submission = orch.submit_job(sample_repo()).await.unwrap();
    let upload = provis_pipeline::ingest::upload_path(&ctx.uploads_dir(), &submission.job_id);
    assert!(upload.exists());
    let cancelled = orch.cancel_job(submission.job_id).await.unwrap();
    assert!(cancelled.cancel_requested);

    let pool = WorkerPool::new(orch.clone(), 1);
    pool.start().await.unwrap();
    let job = wait_for_terminal(&orch, submission.job_id).await;
    pool.stop().await.unwrap();

    assert_eq!(job.phase, JobPhase::Failed);
    assert_eq!(job.error_code.as_deref(), Some("cancelled"));

    let tasks = ctx.ledger.list_tasks(&submission.job_id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Pending);

    let types = event_types(&ctx.ledger.events_after(&submission.job_id, 0).await.unwrap());
    assert_eq!(types, vec!["error"]);

    // Never ingested, so the stored upload goes with the job
    assert!(!upload.exists());

    // Terminal jobs cannot be cancelled
    assert!(matches!(
        orch.cancel_job(submission.job_id).await,
        Err(AppError::InvalidStateTransition(_))
    ));
    assert!(matches!(
        orch.cancel_job(uuid::Uuid::new_v4()).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_recovery_requeues_pending_work() {
    let dir = TempDir::new().unwrap();
    let ledger = create_in_memory_ledger();
    let artifacts = Arc::new(InMemoryArtifactStore::new());

    let before_crash = Arc::new(Orchestrator::new(Arc::new(
        PipelineContext::from_parts(
            Config::for_testing(dir.path()),
            ledger.clone(),
            artifacts.clone(),
            Arc::new(InMemoryQueue::new()),
        )
        .unwrap(),
    )));
    let submission = before_crash.submit_job(sample_repo()).await.unwrap();
    drop(before_crash);

    // Restart with an empty queue over the same ledger
    let ctx = Arc::new(
        PipelineContext::from_parts(
            Config::for_testing(dir.path()),
            ledger,
            artifacts,
            Arc::new(InMemoryQueue::new()),
        )
        .unwrap(),
    );
    assert_eq!(ctx.queue.len().await.unwrap(), 0);

    let orch = Arc::new(Orchestrator::new(ctx.clone()));
    let report = orch.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 1);
    assert_eq!(report.tasks_requeued, 1);
    assert_eq!(ctx.queue.len().await.unwrap(), 1);

    let pool = WorkerPool::new(orch.clone(), 2);
    pool.start().await.unwrap();
    let job = wait_for_terminal(&orch, submission.job_id).await;
    pool.stop().await.unwrap();
    assert_eq!(job.phase, JobPhase::Done);

    // Nothing left to recover
    let report = orch.recover().await.unwrap();
    assert_eq!(report.jobs_resumed, 0);
}

#[tokio::test]
async fn test_reexecuting_a_task_keeps_one_version() {
    let pipeline = TestPipeline::start().await;
    let submission = pipeline
        .orchestrator
        .submit_job(sample_repo())
        .await
        .unwrap();
    let job = pipeline.wait_for_terminal(submission.job_id).await;
    let events_before = pipeline.events(job.id).await.len();

    let ctx = pipeline.ctx();
    let tasks = ctx.ledger.list_tasks(&job.id).await.unwrap();
    for kind in [TaskKind::Merge, TaskKind::Map, TaskKind::Summarize] {
        let task = tasks.iter().find(|t| t.kind == kind).unwrap();
        handlers::execute(&pipeline.orchestrator, task).await.unwrap();
    }

    for kind in [
        ArtifactKind::Files,
        ArtifactKind::Graph,
        ArtifactKind::Summaries,
        ArtifactKind::Capabilities,
    ] {
        let record = ctx
            .artifacts
            .latest_record(&ctx.artifact_key(&job, kind))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 1, "{} gained a version", kind);
    }

    // Terminal jobs publish nothing further
    assert_eq!(pipeline.events(job.id).await.len(), events_before);
}

#[tokio::test]
async fn test_event_replay_reproduces_status() {
    let pipeline = TestPipeline::start().await;
    let submission = pipeline
        .orchestrator
        .submit_job(sample_repo())
        .await
        .unwrap();
    let job = pipeline.wait_for_terminal(submission.job_id).await;

    let ctx = pipeline.ctx();
    let events = pipeline.events(job.id).await;
    let folded = fold(&job.repo_id, &events);
    assert_eq!(folded, job.status());
    assert_eq!(
        ctx.bus.overlay().get(&job.id).await.unwrap().unwrap(),
        job.status()
    );

    // A rebuilt overlay agrees with the ledger
    ctx.bus.overlay().rebuild().await.unwrap();
    assert_eq!(
        ctx.bus.overlay().get(&job.id).await.unwrap().unwrap(),
        folded
    );

    // Subscribers replay the same sequence and the stream ends at `done`
    let streamed: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        ctx.bus.subscribe(job.id, 0).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(streamed, events);

    let resumed: Vec<_> = tokio::time::timeout(
        Duration::from_secs(5),
        ctx.bus.subscribe(job.id, 3).collect::<Vec<_>>(),
    )
    .await
    .unwrap();
    assert_eq!(resumed.first().map(|e| e.seq), Some(4));
    assert_eq!(resumed.len(), events.len() - 3);
}

#[tokio::test]
async fn test_empty_repo_runs_with_single_empty_batch() {
    let pipeline = TestPipeline::start().await;
    let submission = pipeline
        .orchestrator
        .submit_job(build_zip(&[("assets/logo.png", "not really a png")]))
        .await
        .unwrap();
    let job = pipeline.wait_for_terminal(submission.job_id).await;
    assert_eq!(job.phase, JobPhase::Done);

    let tasks = pipeline.ctx().ledger.list_tasks(&job.id).await.unwrap();
    let batches: Vec<_> = tasks
        .iter()
        .filter(|t| t.kind == TaskKind::ParseBatch)
        .collect();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].batch.as_ref().unwrap().files.is_empty());
}

#[tokio::test]
async fn test_large_repo_fans_out_batches() {
    let files: Vec<(String, String)> = (0..12)
        .map(|i| {
            (
                format!("lib/mod{}.py", i),
                format!("import os\nfrom lib import mod{}\n\ndef f{}():\n    pass\n", (i + 1) % 12, i),
            )
        })
        .collect();
    let refs: Vec<(&str, &str)> = files.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();

    let pipeline = TestPipeline::start_with(|config| {
        config.analysis.parse_batch_size = 5;
        config.server.workers = 4;
    })
    .await;
    let submission = pipeline.orchestrator.submit_job(build_zip(&refs)).await.unwrap();
    let job = pipeline.wait_for_terminal(submission.job_id).await;
    assert_eq!(job.phase, JobPhase::Done);

    let ctx = pipeline.ctx();
    let tasks = ctx.ledger.list_tasks(&job.id).await.unwrap();
    assert_eq!(
        tasks.iter().filter(|t| t.kind == TaskKind::ParseBatch).count(),
        3
    );
    assert_eq!(tasks.iter().filter(|t| t.kind == TaskKind::Merge).count(), 1);

    let parsed: Vec<_> = pipeline
        .events(job.id)
        .await
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::BatchParsed { .. }))
        .collect();
    assert_eq!(parsed.len(), 3);
}

async fn assert_concurrent_uploads_share_snapshot(pipeline: TestPipeline) {
    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = pipeline.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.submit_job(sample_repo()).await.unwrap()
        }));
    }
    let mut submissions = Vec::new();
    for handle in handles {
        submissions.push(handle.await.unwrap());
    }

    let repo_ids: BTreeSet<_> = submissions.iter().map(|s| s.repo_id.clone()).collect();
    let snapshot_ids: BTreeSet<_> = submissions.iter().map(|s| s.snapshot_id.clone()).collect();
    assert_eq!(repo_ids.len(), 1);
    assert_eq!(snapshot_ids.len(), 1);

    for submission in &submissions {
        let job = pipeline.wait_for_terminal(submission.job_id).await;
        assert_eq!(job.phase, JobPhase::Done, "job {} ended {:?}", job.id, job.error);
    }

    let ledger = &pipeline.ctx().ledger;
    let repo_id = repo_ids.into_iter().next().unwrap();
    let snapshot = ledger
        .latest_snapshot_for_repo(&repo_id)
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot_ids.contains(&snapshot.id));
    assert_eq!(ledger.list_jobs().await.unwrap().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_in_memory() {
    let pipeline = TestPipeline::start_with(|config| {
        config.server.workers = 4;
    })
    .await;
    assert_concurrent_uploads_share_snapshot(pipeline).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_uploads_with_sled() {
    let pipeline = TestPipeline::start_with(|config| {
        config.server.workers = 4;
        config.state.backend = StateBackend::Sled;
        config.state.path = config.storage.data_dir.join("ledger");
    })
    .await;
    assert_concurrent_uploads_share_snapshot(pipeline).await;
}
