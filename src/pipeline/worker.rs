use super::handlers;
use super::orchestrator::Orchestrator;
use crate::error::{AppError, Result, TaskError};
use crate::metrics::helpers::{record_error, record_task};
use crate::metrics::TASK_RETRIES_TOTAL;
use crate::models::{TaskEnvelope, TaskState};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed set of workers pulling from the task queue
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    running: Arc<RwLock<bool>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        Self {
            orchestrator,
            workers: workers.max(1),
            running: Arc::new(RwLock::new(false)),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(AppError::Internal("Worker pool already running".to_string()));
        }
        *running = true;
        drop(running);

        info!(workers = self.workers, "🚀 Starting worker pool");

        let mut handles = self.handles.lock();
        for index in 0..self.workers {
            let orchestrator = Arc::clone(&self.orchestrator);
            let running = Arc::clone(&self.running);
            handles.push(tokio::spawn(async move {
                worker_loop(index, orchestrator, running).await;
            }));
        }
        Ok(())
    }

    /// Stop pulling new tasks and wait for in-flight ones to finish
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Err(AppError::Internal("Worker pool not running".to_string()));
        }
        *running = false;
        drop(running);

        info!("🛑 Stopping worker pool");
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker exited abnormally: {}", e);
            }
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

async fn worker_loop(index: usize, orchestrator: Arc<Orchestrator>, running: Arc<RwLock<bool>>) {
    let ctx = Arc::clone(orchestrator.context());
    let timeout = Duration::from_millis(ctx.config.queue.dequeue_timeout_ms);
    debug!(worker = index, "Worker started");

    while *running.read().await {
        let envelope = match ctx.queue.dequeue(timeout).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) => {
                error!(worker = index, error = %e, "Dequeue failed");
                record_error("worker", e.error_code());
                tokio::time::sleep(timeout).await;
                continue;
            }
        };

        if let Err(e) = process(&orchestrator, &envelope).await {
            error!(
                worker = index,
                job_id = %envelope.job_id,
                task = %envelope.kind,
                error = %e,
                "Task bookkeeping failed"
            );
            record_error("worker", e.error_code());
        }
        if let Err(e) = ctx.queue.ack(&envelope).await {
            warn!(worker = index, error = %e, "Ack failed");
        }
    }

    debug!(worker = index, "Worker stopped");
}

/// Run one dequeued task to completion, retry or failure
pub async fn process(orchestrator: &Orchestrator, envelope: &TaskEnvelope) -> Result<()> {
    let ctx = orchestrator.context();
    let Some(mut task) = ctx.ledger.get_task(&envelope.task_id).await? else {
        warn!(task_id = %envelope.task_id, "Dequeued unknown task");
        return Ok(());
    };
    if task.state == TaskState::Succeeded {
        debug!(key = %task.idempotency_key, "Task already succeeded, skipping");
        return Ok(());
    }
    if orchestrator.should_stop(&task.job_id).await? {
        debug!(key = %task.idempotency_key, "Job ended or cancelled, skipping task");
        return Ok(());
    }

    orchestrator.on_task_started(&task).await?;
    task.start();
    ctx.ledger.save_task(&task).await?;

    info!(
        job_id = %task.job_id,
        task = %task.kind,
        key = %task.idempotency_key,
        attempt = task.attempt,
        "task_start"
    );
    let started = Instant::now();
    let result = handlers::execute(orchestrator, &task).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(output) => {
            task.succeed(output);
            ctx.ledger.save_task(&task).await?;
            record_task(task.kind.as_ref(), "succeeded", elapsed);
            info!(
                job_id = %task.job_id,
                task = %task.kind,
                key = %task.idempotency_key,
                duration_secs = elapsed,
                "task_end"
            );
            orchestrator.on_task_succeeded(&task).await
        }
        Err(e) => {
            let err = TaskError::from(&e);
            let policy = ctx.config.retry_policy(task.kind);

            if err.retryable() && policy.should_retry(task.attempt) {
                let delay = policy.delay(task.attempt, ctx.config.queue.backoff_scale);
                task.state = TaskState::Pending;
                task.error = Some(err.clone());
                ctx.ledger.save_task(&task).await?;
                record_task(task.kind.as_ref(), "retried", elapsed);
                TASK_RETRIES_TOTAL
                    .with_label_values(&[task.kind.as_ref()])
                    .inc();
                warn!(
                    job_id = %task.job_id,
                    task = %task.kind,
                    key = %task.idempotency_key,
                    attempt = task.attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Task failed, retrying"
                );

                let queue = Arc::clone(&ctx.queue);
                let envelope = task.envelope();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = queue.enqueue(envelope).await {
                        error!(task_id = %envelope.task_id, error = %e, "Failed to requeue task");
                    }
                });
                Ok(())
            } else {
                task.fail(err.clone());
                ctx.ledger.save_task(&task).await?;
                record_task(task.kind.as_ref(), "failed", elapsed);
                error!(
                    job_id = %task.job_id,
                    task = %task.kind,
                    key = %task.idempotency_key,
                    attempt = task.attempt,
                    code = %err.code,
                    error = %err,
                    "task_end"
                );
                orchestrator.on_task_failed(&task, &err).await
            }
        }
    }
}
