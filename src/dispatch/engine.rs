use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineCommand;
use crate::job::TestJob;

/// Successful engine result.
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub output: Value,
    pub artifacts: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The invocation could not start (resource exhaustion, missing
    /// binary). The entry is requeued within the retry budget.
    #[error("engine start rejected: {0}")]
    StartRejected(String),

    /// The engine ran and failed. Terminal for the job.
    #[error("engine execution failed: {0}")]
    Execution(String),

    /// The run was aborted after observing the cancellation marker.
    #[error("engine run cancelled")]
    Cancelled,
}

/// Boundary to the external test engine.
///
/// Implementations report coarse progress (0-100) through `progress` and
/// should watch `cancel`, aborting best-effort when it fires. Engines that
/// cannot pre-empt may run to natural completion; the store's terminal
/// write discipline resolves the race either way.
#[async_trait]
pub trait TestEngine: Send + Sync {
    async fn run(
        &self,
        job: &TestJob,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> std::result::Result<EngineOutcome, EngineError>;
}

/// Runs the external engine binary, one process per job.
///
/// Invocation: `<program> <base args> --gid <gid> --cid <cid>` with the
/// job arguments written to stdin as JSON. On success, stdout is parsed as
/// the result payload; an `artifacts` array of file references inside it
/// is lifted onto the job record. The child is killed when the
/// cancellation marker fires.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    command: EngineCommand,
}

impl ProcessEngine {
    pub fn new(command: EngineCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestEngine for ProcessEngine {
    async fn run(
        &self,
        job: &TestJob,
        progress: mpsc::Sender<u8>,
        cancel: CancellationToken,
    ) -> std::result::Result<EngineOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        tracing::info!(
            job_id = %job.id,
            gid = %job.gid,
            cid = %job.cid,
            program = %self.command.program,
            "Invoking test engine"
        );

        let mut child = Command::new(&self.command.program)
            .args(&self.command.base_args)
            .arg("--gid")
            .arg(&job.gid)
            .arg("--cid")
            .arg(&job.cid)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the worker task is torn down mid-wait (shutdown abort),
            // the engine process must not outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::StartRejected(e.to_string()))?;

        let _ = progress.send(0).await;

        if let Some(mut stdin) = child.stdin.take() {
            let body =
                serde_json::to_vec(&job.arguments).map_err(|e| EngineError::Execution(e.to_string()))?;
            stdin
                .write_all(&body)
                .await
                .map_err(|e| EngineError::Execution(e.to_string()))?;
            // Closing stdin signals the engine that the payload is complete.
            drop(stdin);
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(job_id = %job.id, "Cancellation observed, killing engine process");
                let _ = child.kill().await;
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => {
                status.map_err(|e| EngineError::Execution(e.to_string()))?
            }
        };

        let mut out = Vec::new();
        if let Some(ref mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut out).await;
        }
        let mut err = Vec::new();
        if let Some(ref mut stderr) = stderr {
            let _ = stderr.read_to_end(&mut err).await;
        }

        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&err).trim().to_string();
            let message = if stderr_text.is_empty() {
                format!("engine exited with {:?}", status.code())
            } else {
                stderr_text
            };
            tracing::warn!(job_id = %job.id, exit_code = ?status.code(), "Engine run failed");
            return Err(EngineError::Execution(message));
        }

        let output: Value = serde_json::from_slice(&out)
            .map_err(|e| EngineError::Execution(format!("unreadable engine output: {e}")))?;
        let artifacts = output
            .get("artifacts")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let _ = progress.send(100).await;
        Ok(EngineOutcome { output, artifacts })
    }
}
