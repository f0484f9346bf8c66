
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use veriq::error::Error;
use veriq::job::{JobKind, JobStatus};
use veriq::queue::MemoryJobLog;
use veriq::report::SummaryPdfRenderer;
use veriq::schema::StaticSchemaRegistry;
use veriq::service::{EngineQueue, TestRunSpec};
use veriq::store::MemoryStateStore;
use veriq::QueueConfig;

use harness::{Harness, ScriptedEngine};

async fn queue_with_registry(registry: StaticSchemaRegistry) -> (Arc<EngineQueue>, TempDir) {
    let report_dir = TempDir::new().expect("tempdir");
    let config = QueueConfig::default()
        .with_workers(0)
        .with_report_dir(report_dir.path().to_path_buf());
    let queue = EngineQueue::start(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryJobLog::new()),
        Arc::new(ScriptedEngine::new()),
        Arc::new(registry),
        Arc::new(SummaryPdfRenderer),
    )
    .await
    .expect("engine queue starts");
    (queue, report_dir)
}

/// One bad spec rejects the whole batch: nothing is enqueued, even for
/// the specs that would have validated.
#[tokio::test]
async fn batch_validation_is_all_or_nothing() {
    let registry = StaticSchemaRegistry::new().with_schema("g1", "c1", ["dataset_path"]);
    let (queue, _reports) = queue_with_registry(registry).await;

    let valid = TestRunSpec {
        kind: JobKind::AlgorithmTest,
        gid: "g1".to_string(),
        cid: "c1".to_string(),
        arguments: json!({"dataset_path": "/d.csv"}),
    };
    let invalid = TestRunSpec {
        arguments: json!({"wrong_key": 1}),
        ..valid.clone()
    };

    let err = queue
        .queue_tests("p1", &[valid, invalid])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(queue.project_jobs("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_algorithm_is_rejected() {
    let registry = StaticSchemaRegistry::new();
    let (queue, _reports) = queue_with_registry(registry).await;

    let err = queue
        .queue_tests("p1", &[Harness::spec("g-nobody-knows")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
}

/// The dataset and model entry points fix the job kind regardless of what
/// the spec carries.
#[tokio::test]
async fn dataset_and_model_submissions_force_their_kind() {
    let config = QueueConfig::default().with_workers(0);
    let h = Harness::start_with(ScriptedEngine::new(), config).await;

    let spec = Harness::spec("g1");
    assert_eq!(spec.kind, JobKind::AlgorithmTest);

    let dataset = h.queue.queue_dataset("p1", &spec).await.unwrap();
    let model = h.queue.queue_model("p1", &spec).await.unwrap();

    assert_eq!(
        h.queue.job(dataset).await.unwrap().kind,
        JobKind::DatasetValidation
    );
    assert_eq!(h.queue.job(model).await.unwrap().kind, JobKind::ModelTest);
}

async fn queue_with_log_capacity(max_pending: usize) -> (Arc<EngineQueue>, TempDir) {
    let report_dir = TempDir::new().expect("tempdir");
    let config = QueueConfig::default()
        .with_workers(0)
        .with_report_dir(report_dir.path().to_path_buf());
    let queue = EngineQueue::start(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryJobLog::with_capacity(max_pending)),
        Arc::new(ScriptedEngine::new()),
        Arc::new(veriq::schema::PermissiveSchemaRegistry),
        Arc::new(SummaryPdfRenderer),
    )
    .await
    .expect("engine queue starts");
    (queue, report_dir)
}

/// A failed append must not leave a Queued record behind: such a job can
/// never be delivered and would keep the project's report from ever
/// generating.
#[tokio::test]
async fn full_queue_rejects_submission_without_stranding_a_record() {
    let (queue, _reports) = queue_with_log_capacity(0).await;

    let err = queue
        .queue_tests("p1", &[Harness::spec("g1")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable(_)));
    assert!(queue.project_jobs("p1").await.unwrap().is_empty());
}

/// When the queue fills partway through a batch, jobs already appended
/// stay queued and only the failed submission is rolled back.
#[tokio::test]
async fn partial_batch_rolls_back_only_the_failed_job() {
    let (queue, _reports) = queue_with_log_capacity(1).await;

    let err = queue
        .queue_tests("p1", &[Harness::spec("g1"), Harness::spec("g2")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueUnavailable(_)));

    let jobs = queue.project_jobs("p1").await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].gid, "g1");
    assert_eq!(jobs[0].status, JobStatus::Queued);
}

/// Subscribers observe the lifecycle in order: Queued, Running with
/// climbing progress, then the terminal Completed at 100.
#[tokio::test]
async fn events_trace_the_job_lifecycle() {
    let h = Harness::start(ScriptedEngine::new()).await;
    let mut events = h.queue.subscribe();

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g1")])
        .await
        .unwrap();
    let job_id = ids[0];
    h.wait_terminal(job_id, Duration::from_secs(2)).await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.job_id == job_id {
            statuses.push((event.status, event.progress));
        }
    }

    assert_eq!(statuses.first().map(|s| s.0), Some(JobStatus::Queued));
    assert_eq!(
        statuses.last().copied(),
        Some((JobStatus::Completed, 100u8))
    );
    assert!(statuses
        .iter()
        .any(|(status, _)| *status == JobStatus::Running));
}
