
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use veriq::dispatch::ProcessEngine;
use veriq::job::{FailureReason, JobStatus};
use veriq::queue::MemoryJobLog;
use veriq::report::SummaryPdfRenderer;
use veriq::schema::PermissiveSchemaRegistry;
use veriq::service::EngineQueue;
use veriq::store::MemoryStateStore;
use veriq::{EngineCommand, QueueConfig};

use harness::{EngineScript, Harness, ScriptedEngine};

/// With nothing in flight, shutdown drains the pool within the grace
/// period and settled jobs keep their outcomes.
#[tokio::test]
async fn shutdown_drains_idle_pool() {
    let h = Harness::start(ScriptedEngine::new()).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g1"), Harness::spec("g2")])
        .await
        .unwrap();
    for id in &ids {
        h.wait_terminal(*id, Duration::from_secs(2)).await;
    }

    h.queue.shutdown().await.unwrap();

    for id in ids {
        assert_eq!(h.queue.job(id).await.unwrap().status, JobStatus::Completed);
    }
}

/// A job that outlives the grace period is force-failed with the
/// shutdown reason rather than left Running forever.
#[tokio::test]
async fn shutdown_force_fails_jobs_past_grace() {
    let engine = ScriptedEngine::new().with_script("g-stuck", EngineScript::BlockForever);
    let config = QueueConfig::default()
        .with_workers(2)
        .with_shutdown_grace(Duration::from_millis(100));
    let h = Harness::start_with(engine, config).await;

    let ids = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-stuck")])
        .await
        .unwrap();
    let job_id = ids[0];
    h.wait_for_status(job_id, JobStatus::Running, Duration::from_secs(2))
        .await;

    h.queue.shutdown().await.unwrap();

    let job = h.queue.job(job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.expect("failure recorded").reason,
        FailureReason::ShutdownTimeout
    );
}

/// Once the queue is closed, unclaimed submissions stay Queued: no new
/// work starts during the drain.
#[tokio::test]
async fn shutdown_leaves_unclaimed_jobs_queued() {
    let engine = ScriptedEngine::new().with_script("g-stuck", EngineScript::BlockForever);
    let config = QueueConfig::default()
        .with_workers(1)
        .with_shutdown_grace(Duration::from_millis(100));
    let h = Harness::start_with(engine, config).await;

    let blocked = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-stuck")])
        .await
        .unwrap()[0];
    h.wait_for_status(blocked, JobStatus::Running, Duration::from_secs(2))
        .await;

    // The only worker is occupied; this one cannot be claimed.
    let waiting = h
        .queue
        .queue_tests("p1", &[Harness::spec("g-later")])
        .await
        .unwrap()[0];

    h.queue.shutdown().await.unwrap();

    assert_eq!(
        h.queue.job(waiting).await.unwrap().status,
        JobStatus::Queued
    );
    // The waiting job was never handed to the engine.
    assert_eq!(h.engine.invocation_count(waiting).await, 0);
}

/// Force-failing a job past the grace period must also tear down its
/// external engine process, not just the worker task driving it. The
/// heartbeat file stops growing once the child is gone.
#[tokio::test]
async fn shutdown_tears_down_external_engine_processes() {
    let dir = TempDir::new().expect("tempdir");
    let heartbeat = dir.path().join("heartbeat");
    let script = format!(
        "while true; do echo beat >> {}; sleep 0.05; done",
        heartbeat.display()
    );
    let engine = Arc::new(ProcessEngine::new(EngineCommand {
        program: "sh".to_string(),
        base_args: vec!["-c".to_string(), script],
    }));

    let config = QueueConfig::default()
        .with_workers(1)
        .with_shutdown_grace(Duration::from_millis(100))
        .with_report_dir(dir.path().to_path_buf());
    let queue = EngineQueue::start(
        config,
        Arc::new(MemoryStateStore::new()),
        Arc::new(MemoryJobLog::new()),
        engine,
        Arc::new(PermissiveSchemaRegistry),
        Arc::new(SummaryPdfRenderer),
    )
    .await
    .expect("engine queue starts");

    let ids = queue
        .queue_tests("p1", &[Harness::spec("g1")])
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !heartbeat.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine process never started"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    queue.shutdown().await.unwrap();

    let job = queue.job(ids[0]).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error.expect("failure recorded").reason,
        FailureReason::ShutdownTimeout
    );

    // Give any in-flight write a moment to land, then require silence.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = tokio::fs::metadata(&heartbeat).await.unwrap().len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        tokio::fs::metadata(&heartbeat).await.unwrap().len(),
        settled,
        "engine process still running after shutdown"
    );
}

/// Calling shutdown twice is a caller error, not a hang.
#[tokio::test]
async fn second_shutdown_is_rejected() {
    let h = Harness::start(ScriptedEngine::new()).await;
    h.queue.shutdown().await.unwrap();
    assert!(h.queue.shutdown().await.is_err());
}
