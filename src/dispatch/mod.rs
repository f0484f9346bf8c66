//! Worker pool pulling from the durable queue.
//!
//! A fixed number of tokio tasks compete on [`JobLog::next`]. No global
//! lock serializes dispatch; a worker that receives an entry first takes
//! ownership through the store's claim CAS, so a redelivered or duplicate
//! entry is recognized (`ClaimConflict`) and skipped rather than executed
//! twice.

pub mod engine;

pub use engine::{EngineError, EngineOutcome, ProcessEngine, TestEngine};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::error::{Error, Result};
use crate::job::{FailureReason, JobFailure, JobStatus, TestJob};
use crate::progress::ProgressPublisher;
use crate::queue::{JobLog, QueueEntry};
use crate::report::ReportGenerator;
use crate::store::{FinishOutcome, StateStore, TerminalKind};

struct WorkerContext {
    store: Arc<dyn StateStore>,
    log: Arc<dyn JobLog>,
    engine: Arc<dyn TestEngine>,
    cancels: Arc<CancelRegistry>,
    publisher: Arc<ProgressPublisher>,
    reports: Arc<ReportGenerator>,
    max_retries: u32,
    retry_backoff: Duration,
}

/// The dispatcher owns the worker pool. Constructed started; stopped via
/// [`Dispatcher::shutdown`] after the queue has been closed.
pub struct Dispatcher {
    handles: Vec<JoinHandle<()>>,
    active: Arc<Mutex<HashMap<Uuid, u64>>>,
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        workers: usize,
        store: Arc<dyn StateStore>,
        log: Arc<dyn JobLog>,
        engine: Arc<dyn TestEngine>,
        cancels: Arc<CancelRegistry>,
        publisher: Arc<ProgressPublisher>,
        reports: Arc<ReportGenerator>,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            store,
            log,
            engine,
            cancels,
            publisher,
            reports,
            max_retries,
            retry_backoff,
        });
        let active = Arc::new(Mutex::new(HashMap::new()));

        let handles = (1..=workers as u64)
            .map(|worker_id| {
                let ctx = ctx.clone();
                let active = active.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, ctx, active).await;
                })
            })
            .collect();

        tracing::info!(workers, "Dispatcher started");
        Self {
            handles,
            active,
            ctx,
        }
    }

    /// Wait up to `grace` for in-flight jobs, then force-fail whatever is
    /// still running with reason ShutdownTimeout and abort the workers.
    /// The queue must already be closed so no new entries are claimed.
    pub async fn shutdown(self, grace: Duration) -> Result<()> {
        let deadline = Instant::now() + grace;
        let mut stragglers = Vec::new();

        for mut handle in self.handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => stragglers.push(handle),
            }
        }

        if stragglers.is_empty() {
            tracing::info!("All workers drained within the grace period");
            return Ok(());
        }

        tracing::warn!(
            stragglers = stragglers.len(),
            "Grace period expired, forcing remaining jobs to Failed"
        );
        for handle in &stragglers {
            handle.abort();
        }

        let abandoned: Vec<(Uuid, u64)> = self.active.lock().await.drain().collect();
        for (job_id, worker_id) in abandoned {
            let failure = JobFailure::new(
                FailureReason::ShutdownTimeout,
                "job still running when the shutdown grace period expired",
            );
            match self
                .ctx
                .store
                .finish(job_id, TerminalKind::Failed(failure))
                .await
            {
                Ok(FinishOutcome::Applied(job)) => {
                    tracing::warn!(job_id = %job_id, worker_id, "Job force-failed on shutdown");
                    self.ctx.publisher.publish(&job);
                }
                Ok(FinishOutcome::AlreadyTerminal(_)) => {}
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to force-fail job on shutdown")
                }
            }
            self.ctx.cancels.deregister(job_id).await;
        }
        Ok(())
    }
}

async fn worker_loop(
    worker_id: u64,
    ctx: Arc<WorkerContext>,
    active: Arc<Mutex<HashMap<Uuid, u64>>>,
) {
    tracing::debug!(worker_id, "Worker started");
    while let Some(entry) = ctx.log.next().await {
        if let Err(e) = handle_entry(worker_id, &ctx, &active, entry).await {
            tracing::error!(worker_id, error = %e, "Worker failed to settle entry");
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn handle_entry(
    worker_id: u64,
    ctx: &WorkerContext,
    active: &Mutex<HashMap<Uuid, u64>>,
    entry: QueueEntry,
) -> Result<()> {
    let job_id = entry.job_id;

    // Register the cancellation marker before claiming, so a cancel that
    // lands between claim and engine start always reaches a live token.
    let token = ctx.cancels.register(job_id).await;

    let job = match ctx.store.claim(job_id, worker_id).await {
        Ok(job) => job,
        Err(Error::ClaimConflict { status, .. }) => {
            // Expected under redelivery, or the job was cancelled while
            // still queued. Settle the entry and move on.
            tracing::debug!(job_id = %job_id, worker_id, %status, "Entry already settled, skipping");
            ctx.cancels.deregister(job_id).await;
            ctx.log.ack(job_id).await?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, worker_id, error = %e, "Claim failed, dropping entry");
            ctx.cancels.deregister(job_id).await;
            ctx.log.ack(job_id).await?;
            return Ok(());
        }
    };

    active.lock().await.insert(job_id, worker_id);
    ctx.publisher.publish(&job);
    tracing::info!(job_id = %job_id, worker_id, kind = %job.kind, gid = %job.gid, "Job claimed");

    let result = run_engine(ctx, &job, token).await;
    let settled = settle(worker_id, ctx, &job, entry, result).await;

    active.lock().await.remove(&job_id);
    ctx.cancels.deregister(job_id).await;
    settled
}

/// Drive the engine while relaying its progress checkpoints to the store
/// and publisher.
async fn run_engine(
    ctx: &WorkerContext,
    job: &TestJob,
    token: tokio_util::sync::CancellationToken,
) -> std::result::Result<EngineOutcome, EngineError> {
    if token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let (progress_tx, mut progress_rx) = mpsc::channel(16);
    let mut run = Box::pin(ctx.engine.run(job, progress_tx, token));

    loop {
        tokio::select! {
            result = &mut run => return result,
            Some(progress) = progress_rx.recv() => {
                match ctx.store.set_progress(job.id, progress).await {
                    Ok(updated) => ctx.publisher.publish(&updated),
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Progress write failed")
                    }
                }
            }
        }
    }
}

async fn settle(
    worker_id: u64,
    ctx: &WorkerContext,
    job: &TestJob,
    entry: QueueEntry,
    result: std::result::Result<EngineOutcome, EngineError>,
) -> Result<()> {
    let job_id = job.id;
    let terminal = match result {
        Ok(outcome) => TerminalKind::Completed {
            output: outcome.output,
            artifacts: outcome.artifacts,
        },
        Err(EngineError::Cancelled) => TerminalKind::Cancelled,
        Err(EngineError::Execution(message)) => {
            TerminalKind::Failed(JobFailure::new(FailureReason::EngineError, message))
        }
        Err(EngineError::StartRejected(message)) => {
            if entry.attempt < ctx.max_retries {
                return requeue(worker_id, ctx, entry, &message).await;
            }
            TerminalKind::Failed(JobFailure::new(
                FailureReason::MaxRetriesExceeded,
                format!(
                    "engine start rejected after {} attempts: {message}",
                    entry.attempt + 1
                ),
            ))
        }
    };

    match ctx.store.finish(job_id, terminal).await {
        Ok(FinishOutcome::Applied(updated)) => {
            tracing::info!(job_id = %job_id, worker_id, status = %updated.status, "Job settled");
            ctx.publisher.publish(&updated);
            if let Err(e) = ctx.reports.maybe_generate(&updated.project_id).await {
                // Report failures are recorded on the report record only;
                // the job outcome stands.
                tracing::warn!(project_id = %updated.project_id, error = %e, "Report generation failed");
            }
        }
        Ok(FinishOutcome::AlreadyTerminal(current)) => {
            tracing::debug!(job_id = %job_id, status = %current.status, "Lost terminal-write race");
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Terminal write rejected");
        }
    }

    ctx.log.ack(job_id).await
}

async fn requeue(
    worker_id: u64,
    ctx: &WorkerContext,
    entry: QueueEntry,
    message: &str,
) -> Result<()> {
    let job_id = entry.job_id;
    tracing::warn!(
        job_id = %job_id,
        worker_id,
        attempt = entry.attempt,
        message,
        "Engine start rejected, requeueing"
    );

    // Hand ownership back so the redelivered entry can be claimed.
    match ctx.store.release(job_id, worker_id).await {
        Ok(job) => ctx.publisher.publish(&job),
        Err(Error::ClaimConflict { status, .. }) => {
            // Cancelled while we held it; let the cancel settle it.
            tracing::debug!(job_id = %job_id, %status, "Release skipped, job no longer ours");
            if status == JobStatus::CancelRequested {
                if let Ok(FinishOutcome::Applied(job)) =
                    ctx.store.finish(job_id, TerminalKind::Cancelled).await
                {
                    ctx.publisher.publish(&job);
                }
            }
            return ctx.log.ack(job_id).await;
        }
        Err(e) => return Err(e),
    }

    let backoff = ctx.retry_backoff;
    let jitter_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(0..=backoff.as_millis() as u64)
    };
    tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
    ctx.log.requeue(entry).await
}
