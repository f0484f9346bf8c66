use std::path::PathBuf;
use std::time::Duration;

/// Invocation of the external test-engine binary.
///
/// The engine is launched once per job as
/// `<program> <base args> --gid <gid> --cid <cid>` with the job's
/// arguments written to stdin as JSON and the result payload read from
/// stdout as JSON.
#[derive(Debug, Clone)]
pub struct EngineCommand {
    /// Path or name of the engine executable.
    pub program: String,
    /// Arguments prepended before the per-job flags.
    pub base_args: Vec<String>,
}

impl Default for EngineCommand {
    fn default() -> Self {
        Self {
            program: "test-engine".to_string(),
            base_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of dispatcher worker tasks competing on the queue.
    pub workers: usize,
    /// Requeue budget for jobs whose engine invocation cannot start.
    pub max_retries: u32,
    /// Base delay before a rejected entry is requeued (jitter is added).
    pub retry_backoff: Duration,
    /// How long shutdown waits for in-flight jobs before force-failing them.
    pub shutdown_grace: Duration,
    /// Capacity of the progress broadcast channel. Lagging subscribers
    /// lose the oldest events.
    pub event_buffer: usize,
    /// Hard cap on queued-but-unsettled entries.
    pub max_pending: usize,
    /// Directory for the state journal and queue log.
    pub data_dir: PathBuf,
    /// Directory where report artifacts are written.
    pub report_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            event_buffer: 256,
            max_pending: 10_000,
            data_dir: PathBuf::from("data"),
            report_dir: PathBuf::from("reports"),
        }
    }
}

impl QueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = dir.into();
        self
    }
}
