//! Worker-side restoration pipeline.
//!
//! Per task: resume the trace context, mark the record running, materialize
//! the source image, classify → enhance → call the provider, store the
//! result, mark succeeded. Failures are reported to the queue engine, which
//! owns the retry budget; compensation happens only on the dead-letter path.

pub mod classify;
pub mod preprocess;
pub mod prompt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::services::context::AppContext;
use crate::services::queue::{LeasedTask, TaskQueue};
use crate::services::records::{MarkOutcome, StageTimings, SuccessFields};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stage failure. Rendered as `kind: message` so the queue and the
/// dead-letter writer can recover the kind.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    pub kind: &'static str,
    pub message: String,
}

impl PipelineError {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Run one leased task through the pipeline. Queue acknowledgement is the
/// caller's job; this only mutates the job record and the blob store.
pub async fn process_lease(ctx: &AppContext, lease: &LeasedTask) -> Result<(), PipelineError> {
    let task = &lease.envelope.task;
    let span = tracing::info_span!(
        "worker.process",
        job_id = %task.job_id,
        attempt = lease.attempt,
        owner = %task.owner,
        traceparent = task.trace.traceparent.as_deref().unwrap_or(""),
        tracestate = task.trace.tracestate.as_deref().unwrap_or(""),
    );

    let ctx_ref = ctx;
    async move {
        let job_id = task.job_id;
        let total_started = Instant::now();

        match ctx_ref
            .records
            .mark_running(&job_id, lease.attempt)
            .map_err(|e| PipelineError::new("record-write", e.to_string()))?
        {
            MarkOutcome::Applied(_) => {}
            MarkOutcome::AlreadyTerminal(record) => {
                // Duplicate delivery of a finished job: write nothing.
                tracing::info!(status = ?record.status, "job already terminal; skipping");
                return Ok(());
            }
            MarkOutcome::NotFound => {
                return Err(PipelineError::new(
                    "record-missing",
                    format!("no job record for {job_id}"),
                ));
            }
        }

        let source = ctx_ref
            .blobs
            .download(&task.owner, &task.source_object)
            .await
            .map_err(|e| PipelineError::new("source-missing", e.to_string()))?;
        let image = image::load_from_memory(&source)
            .map_err(|e| PipelineError::new("image-decode", e.to_string()))?;

        let classify_started = Instant::now();
        let degradation = classify::classify(&image, task.source_format == "jpeg");
        let classify_ms = classify_started.elapsed().as_millis() as u64;
        tracing::debug!(scores = ?degradation.scores(), "degradation classified");

        let prompt_started = Instant::now();
        let enhanced = prompt::enhance_prompt(&degradation, task.prompt.as_deref());
        let prompt_ms = prompt_started.elapsed().as_millis() as u64;

        let restore_started = Instant::now();
        let stage_timeout = Duration::from_millis(ctx_ref.config.jobs.stage_timeout_ms);
        let restored = tokio::time::timeout(
            stage_timeout,
            ctx_ref.provider.restore(&enhanced, &source),
        )
        .await
        .map_err(|_| PipelineError::new("provider-timeout", "restore stage deadline exceeded"))?
        .map_err(|e| {
            if e.is_transient() {
                PipelineError::new("provider-exhausted", e.to_string())
            } else {
                PipelineError::new("provider", e.to_string())
            }
        })?;
        let restore_ms = restore_started.elapsed().as_millis() as u64;

        let result_object = format!("{}/{}-res.jpg", task.owner, job_id);
        ctx_ref
            .blobs
            .put(&task.owner, &result_object, &restored.bytes)
            .await
            .map_err(|e| PipelineError::new("result-store", e.to_string()))?;

        let timings = StageTimings {
            classify_ms,
            prompt_ms,
            restore_ms,
            total_ms: total_started.elapsed().as_millis() as u64,
        };
        ctx_ref
            .records
            .mark_succeeded(
                &job_id,
                SuccessFields {
                    timings,
                    classification: degradation.to_summary(),
                    enhanced_prompt: enhanced,
                    provider: restored.receipt,
                    result_object,
                },
            )
            .map_err(|e| PipelineError::new("record-write", e.to_string()))?;

        tracing::info!(
            classify_ms,
            prompt_ms,
            restore_ms,
            total_ms = timings.total_ms,
            "restoration succeeded"
        );
        Ok(())
    }
    .instrument(span)
    .await
}

/// Process one lease with heartbeats and the hard deadline, then acknowledge.
pub async fn run_one(ctx: &Arc<AppContext>, lease: LeasedTask) {
    let task_id = lease.envelope.task_id;
    let queue = Arc::clone(&ctx.queue);

    let heartbeat_interval =
        Duration::from_millis((ctx.config.jobs.stalled_check_ms / 3).max(1_000));
    let heartbeat: JoinHandle<()> = tokio::spawn({
        let queue = Arc::clone(&queue);
        async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = queue.heartbeat(task_id) {
                    tracing::warn!(%task_id, %error, "heartbeat failed");
                    break;
                }
            }
        }
    });

    let hard_timeout = Duration::from_millis(ctx.config.jobs.task_timeout_ms);
    let result = tokio::time::timeout(hard_timeout, process_lease(ctx, &lease)).await;
    heartbeat.abort();

    let ack = match result {
        Ok(Ok(())) => queue.complete(task_id).map(|_| ()),
        Ok(Err(error)) => {
            tracing::warn!(%task_id, %error, attempt = lease.attempt, "pipeline attempt failed");
            queue.fail(task_id, &error.to_string()).map(|_| ())
        }
        Err(_) => {
            tracing::warn!(%task_id, "task exceeded hard timeout");
            queue
                .fail(task_id, "task-timeout: hard task deadline exceeded")
                .map(|_| ())
        }
    };
    if let Err(error) = ack {
        tracing::error!(%task_id, %error, "failed to acknowledge task");
    }
}

/// Spawn the worker pool. Each worker claims one task at a time; the pool
/// size bounds per-process concurrency.
pub fn run_workers(ctx: Arc<AppContext>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let concurrency = ctx.config.jobs.worker_concurrency.max(1);
    (0..concurrency)
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                tracing::info!(worker, "worker started");
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match ctx.queue.claim() {
                        Ok(Some(lease)) => run_one(&ctx, lease).await,
                        Ok(None) => {
                            tokio::select! {
                                _ = ctx.queue.wait_for_work() => {}
                                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                        Err(error) => {
                            tracing::error!(worker, %error, "claim failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                tracing::info!(worker, "worker stopped");
            })
        })
        .collect()
}

/// Spawn the stalled-task scheduler: redeliver leases whose heartbeat lapsed.
pub fn run_scheduler(
    queue: Arc<TaskQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = interval.max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match queue.recover_stalled() {
                        Ok(0) => {}
                        Ok(recovered) => {
                            tracing::warn!(recovered, "stalled tasks redelivered");
                        }
                        Err(error) => {
                            tracing::error!(%error, "stalled-task sweep failed");
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
