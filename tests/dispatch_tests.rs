
use std::time::Duration;

use serde_json::json;
use veriq::job::{FailureReason, JobStatus};
use veriq::queue::{JobLog, QueueEntry};
use veriq::QueueConfig;

use harness::{EngineScript, Harness, ScriptedEngine};

/// Scenario J1: a submitted model test runs to completion, progress
/// reaches 100, and the project's report filename resolves.
#[tokio::test]
async fn model_test_runs_to_completion() {
    let engine = ScriptedEngine::new().with_script(
        "g1",
        EngineScript::Complete {
            steps: vec![25, 50, 75],
            output: json!({"accuracy": 0.93}),
        },
    );
    let h = Harness::start(engine).await;

    let job_id = h
        .queue
        .queue_model("project-1", &Harness::spec("g1"))
        .await
        .unwrap();

    let job = h
        .wait_for_status(job_id, JobStatus::Completed, Duration::from_secs(2))
        .await;
    assert_eq!(job.progress, 100);
    assert_eq!(job.output, Some(json!({"accuracy": 0.93})));
    assert!(!job.artifacts.is_empty());
    assert!(job.worker_id.is_some());

    assert_eq!(
        h.queue.get_report_filename("project-1"),
        "report_project-1.pdf"
    );
}

/// Duplicate delivery of the same entry must not execute the job twice:
/// the second consumer loses the claim CAS and skips.
#[tokio::test]
async fn duplicate_delivery_executes_once() {
    let h = Harness::start(ScriptedEngine::new()).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-any")])
        .await
        .unwrap();
    let job_id = ids[0];

    // Redeliver the same submission, as a crashed consumer group would.
    let job = h.queue.job(job_id).await.unwrap();
    h.log.append(QueueEntry::for_job(&job)).await.unwrap();

    let job = h.wait_terminal(job_id, Duration::from_secs(2)).await;
    assert_eq!(job.status, JobStatus::Completed);

    // Let the duplicate work through the pool before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.engine.invocation_count(job_id).await, 1);
}

#[tokio::test]
async fn engine_failure_marks_job_failed() {
    let engine = ScriptedEngine::new()
        .with_script("g-bad", EngineScript::Fail("divergence check blew up".to_string()));
    let h = Harness::start(engine).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-bad")])
        .await
        .unwrap();

    let job = h.wait_terminal(ids[0], Duration::from_secs(2)).await;
    assert_eq!(job.status, JobStatus::Failed);
    let failure = job.error.expect("failure recorded");
    assert_eq!(failure.reason, FailureReason::EngineError);
    assert!(failure.message.contains("divergence"));
}

/// An engine that keeps refusing to start exhausts the retry budget and
/// the job fails with MaxRetriesExceeded.
#[tokio::test]
async fn start_rejection_exhausts_retry_budget() {
    let engine = ScriptedEngine::new()
        .with_script("g-full", EngineScript::RejectStart { succeed_after: None });
    let config = QueueConfig::default()
        .with_workers(2)
        .with_max_retries(2)
        .with_retry_backoff(Duration::from_millis(5));
    let h = Harness::start_with(engine, config).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-full")])
        .await
        .unwrap();

    let job = h.wait_terminal(ids[0], Duration::from_secs(5)).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.expect("failure recorded").reason,
        FailureReason::MaxRetriesExceeded
    );
    // Initial delivery plus two requeues.
    assert_eq!(h.engine.invocation_count(ids[0]).await, 3);
}

/// A transient start rejection clears on requeue and the job completes.
#[tokio::test]
async fn start_rejection_recovers_within_budget() {
    let engine = ScriptedEngine::new().with_script(
        "g-busy",
        EngineScript::RejectStart {
            succeed_after: Some(1),
        },
    );
    let h = Harness::start(engine).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-busy")])
        .await
        .unwrap();

    let job = h.wait_terminal(ids[0], Duration::from_secs(5)).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(h.engine.invocation_count(ids[0]).await, 2);
}

/// Progress is non-decreasing for the lifetime of a running job.
#[tokio::test]
async fn progress_never_regresses() {
    let engine = ScriptedEngine::new().with_script(
        "g1",
        EngineScript::Complete {
            steps: vec![10, 40, 70, 90],
            output: json!({}),
        },
    );
    let h = Harness::start(engine).await;
    let mut events = h.queue.subscribe();

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g1")])
        .await
        .unwrap();
    h.wait_terminal(ids[0], Duration::from_secs(2)).await;

    let mut last = 0u8;
    while let Ok(event) = events.try_recv() {
        if event.status == JobStatus::Running {
            assert!(
                event.progress >= last,
                "progress regressed: {} after {last}",
                event.progress
            );
            last = event.progress;
        }
    }
}
