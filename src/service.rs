use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::cancel::CancelRegistry;
use crate::config::QueueConfig;
use crate::dispatch::{Dispatcher, TestEngine};
use crate::error::{Error, Result};
use crate::job::{JobKind, ProgressEvent, TestJob};
use crate::progress::ProgressPublisher;
use crate::queue::{JobLog, QueueEntry};
use crate::report::{report_filename, Report, ReportGenerator, ReportRenderer};
use crate::schema::SchemaRegistry;
use crate::store::{CancelOutcome, StateStore};

/// One requested test run, as the web layer submits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunSpec {
    pub kind: JobKind,
    pub gid: String,
    pub cid: String,
    pub arguments: Value,
}

/// The Submission API: the boundary the web layer calls.
///
/// Owns the store, queue, worker pool, cancellation registry, progress
/// publisher, and report generator; everything behind it is reached
/// through the narrow trait seams so tests swap in in-memory fakes.
pub struct EngineQueue {
    config: QueueConfig,
    store: Arc<dyn StateStore>,
    log: Arc<dyn JobLog>,
    registry: Arc<dyn SchemaRegistry>,
    publisher: Arc<ProgressPublisher>,
    cancels: Arc<CancelRegistry>,
    reports: Arc<ReportGenerator>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl EngineQueue {
    /// Recover orphaned records, start the worker pool, and return the
    /// running service.
    pub async fn start(
        config: QueueConfig,
        store: Arc<dyn StateStore>,
        log: Arc<dyn JobLog>,
        engine: Arc<dyn TestEngine>,
        registry: Arc<dyn SchemaRegistry>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Result<Arc<Self>> {
        let publisher = Arc::new(ProgressPublisher::new(config.event_buffer));
        let cancels = Arc::new(CancelRegistry::new());
        let reports = Arc::new(ReportGenerator::new(
            store.clone(),
            renderer,
            config.report_dir.clone(),
        ));

        // Jobs stranded mid-run by a previous process go back to Queued
        // before any worker can observe them.
        let recovered = store.recover_orphans().await?;
        for job in &recovered {
            tracing::info!(job_id = %job.id, status = %job.status, "Recovered orphaned job");
            publisher.publish(job);
        }

        let dispatcher = Dispatcher::start(
            config.workers,
            store.clone(),
            log.clone(),
            engine,
            cancels.clone(),
            publisher.clone(),
            reports.clone(),
            config.max_retries,
            config.retry_backoff,
        );

        Ok(Arc::new(Self {
            config,
            store,
            log,
            registry,
            publisher,
            cancels,
            reports,
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    /// Queue a batch of algorithm test runs for a project. Every spec is
    /// validated before any entry is appended, so a validation failure
    /// rejects the whole submission.
    pub async fn queue_tests(&self, project_id: &str, specs: &[TestRunSpec]) -> Result<Vec<Uuid>> {
        for spec in specs {
            self.registry
                .validate(&spec.gid, &spec.cid, &spec.arguments)
                .await?;
        }

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            ids.push(self.enqueue(project_id, spec.kind, spec).await?);
        }
        Ok(ids)
    }

    /// Queue a dataset-validation run.
    pub async fn queue_dataset(&self, project_id: &str, spec: &TestRunSpec) -> Result<Uuid> {
        self.registry
            .validate(&spec.gid, &spec.cid, &spec.arguments)
            .await?;
        self.enqueue(project_id, JobKind::DatasetValidation, spec)
            .await
    }

    /// Queue a model test run.
    pub async fn queue_model(&self, project_id: &str, spec: &TestRunSpec) -> Result<Uuid> {
        self.registry
            .validate(&spec.gid, &spec.cid, &spec.arguments)
            .await?;
        self.enqueue(project_id, JobKind::ModelTest, spec).await
    }

    async fn enqueue(&self, project_id: &str, kind: JobKind, spec: &TestRunSpec) -> Result<Uuid> {
        let job = TestJob::new(
            kind,
            spec.gid.clone(),
            spec.cid.clone(),
            project_id,
            spec.arguments.clone(),
        );
        let job_id = job.id;

        let entry = QueueEntry::for_job(&job);
        self.store.insert(job.clone()).await?;
        if let Err(e) = self.log.append(entry).await {
            // The record must not outlive a submission the caller saw
            // fail: a Queued job with no queue entry can never run and
            // would block the project's report forever.
            if let Err(remove_err) = self.store.remove(job_id).await {
                tracing::error!(
                    job_id = %job_id,
                    error = %remove_err,
                    "Failed to remove record after queue append failure"
                );
            }
            return Err(e);
        }
        self.publisher.publish(&job);

        tracing::info!(
            job_id = %job_id,
            project_id,
            kind = %kind,
            gid = %spec.gid,
            cid = %spec.cid,
            "Job queued"
        );
        Ok(job_id)
    }

    /// Request cancellation of a job. Asynchronous: a Running job is only
    /// marked CancelRequested here and settles when its worker observes
    /// the marker. Idempotent on terminal jobs.
    pub async fn cancel_test_run(&self, job_id: Uuid) -> Result<()> {
        match self.store.request_cancel(job_id).await? {
            CancelOutcome::CancelledBeforeDispatch(job) => {
                tracing::info!(job_id = %job_id, "Job cancelled before dispatch");
                self.publisher.publish(&job);
                // The job just became terminal without a worker settling
                // it, so the project may be complete now.
                if let Err(e) = self.reports.maybe_generate(&job.project_id).await {
                    tracing::warn!(project_id = %job.project_id, error = %e, "Report generation failed");
                }
            }
            CancelOutcome::CancelRequested(job) => {
                tracing::info!(job_id = %job_id, worker_id = ?job.worker_id, "Cancellation requested");
                self.publisher.publish(&job);
                self.cancels.request(job_id).await;
            }
            CancelOutcome::AlreadyTerminal(job) => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Cancel on settled job is a no-op");
            }
        }
        Ok(())
    }

    /// Stop claiming new entries, wait up to the configured grace period
    /// for in-flight jobs, then force-fail the rest with ShutdownTimeout.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(grace = ?self.config.shutdown_grace, "Shutting down engine queue");
        self.log.close();

        let dispatcher = self.dispatcher.lock().await.take();
        match dispatcher {
            Some(dispatcher) => dispatcher.shutdown(self.config.shutdown_grace).await,
            None => Err(Error::Internal("shutdown already invoked".to_string())),
        }
    }

    pub fn get_report_filename(&self, project_id: &str) -> String {
        report_filename(project_id)
    }

    pub async fn report_for(&self, project_id: &str) -> Option<Report> {
        self.reports.report_for(project_id).await
    }

    pub async fn job(&self, job_id: Uuid) -> Result<TestJob> {
        self.store.get(job_id).await
    }

    pub async fn project_jobs(&self, project_id: &str) -> Result<Vec<TestJob>> {
        self.store.project_jobs(project_id).await
    }

    /// Subscribe to status/progress events. Best-effort: a lagging
    /// receiver drops the oldest events and should reconcile by polling
    /// [`EngineQueue::job`].
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.publisher.subscribe()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}
