use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    ModelTest,
    DatasetValidation,
    AlgorithmTest,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::ModelTest => write!(f, "model_test"),
            JobKind::DatasetValidation => write!(f, "dataset_validation"),
            JobKind::AlgorithmTest => write!(f, "algorithm_test"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    CancelRequested,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed
        )
    }

    /// Legal transitions of the job state machine.
    ///
    /// Queued -> Running | Cancelled (cancel before dispatch)
    /// Running -> Completed | Failed | CancelRequested | Cancelled (a
    /// conditioned terminal Cancelled write may land without the
    /// CancelRequested mark ever being observed)
    /// CancelRequested -> Cancelled | Completed | Failed (first terminal
    /// write wins the cancel/complete race)
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, CancelRequested)
                | (Running, Cancelled)
                | (CancelRequested, Cancelled)
                | (CancelRequested, Completed)
                | (CancelRequested, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::CancelRequested => write!(f, "cancel_requested"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job ended up Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    EngineError,
    MaxRetriesExceeded,
    ShutdownTimeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::EngineError => write!(f, "engine_error"),
            FailureReason::MaxRetriesExceeded => write!(f, "max_retries_exceeded"),
            FailureReason::ShutdownTimeout => write!(f, "shutdown_timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// A single test-execution request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestJob {
    pub id: Uuid,
    pub kind: JobKind,
    /// Algorithm/plugin identifier selecting the test engine.
    pub gid: String,
    /// Component identifier selecting the input schema.
    pub cid: String,
    pub project_id: String,
    /// Schema-validated at submission, opaque afterwards.
    pub arguments: Value,
    pub status: JobStatus,
    /// 0-100, meaningful only while Running.
    pub progress: u8,
    /// Identity of the owning worker; None when unowned.
    pub worker_id: Option<u64>,
    pub output: Option<Value>,
    pub artifacts: Vec<String>,
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestJob {
    pub fn new(
        kind: JobKind,
        gid: impl Into<String>,
        cid: impl Into<String>,
        project_id: impl Into<String>,
        arguments: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            gid: gid.into(),
            cid: cid.into(),
            project_id: project_id.into(),
            arguments,
            status: JobStatus::Queued,
            progress: 0,
            worker_id: None,
            output: None,
            artifacts: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Status/progress event broadcast to subscribers on every store write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: u8,
}
