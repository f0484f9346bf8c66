//! Job record storage with atomic conditional writes.
//!
//! The store is the single source of truth for job lifecycle state and the
//! only place concurrent mutation happens. Correctness of dispatch and
//! cancellation rests on its compare-and-swap discipline:
//!
//! - [`StateStore::claim`] succeeds only while the job is still Queued,
//!   so a redelivered queue entry can never double-dispatch.
//! - [`StateStore::finish`] applies the first terminal write and reports
//!   [`FinishOutcome::AlreadyTerminal`] to every loser of the race.

pub mod json;
pub mod memory;

pub use json::JsonStateStore;
pub use memory::MemoryStateStore;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{JobFailure, TestJob};

/// Payload of a terminal write.
#[derive(Debug, Clone)]
pub enum TerminalKind {
    Completed {
        output: Value,
        artifacts: Vec<String>,
    },
    Failed(JobFailure),
    Cancelled,
}

/// Result of a conditional terminal write.
#[derive(Debug, Clone)]
pub enum FinishOutcome {
    /// This write won; the record now carries the terminal state.
    Applied(TestJob),
    /// Another writer got there first; the record is returned untouched.
    AlreadyTerminal(TestJob),
}

/// Result of a cancellation request against the store.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was still Queued and went straight to Cancelled.
    CancelledBeforeDispatch(TestJob),
    /// The job is Running; it is now marked CancelRequested and the owning
    /// worker must be signalled.
    CancelRequested(TestJob),
    /// The job had already reached a terminal state; nothing to do.
    AlreadyTerminal(TestJob),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the record for a newly submitted job.
    async fn insert(&self, job: TestJob) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<TestJob>;

    async fn project_jobs(&self, project_id: &str) -> Result<Vec<TestJob>>;

    /// Delete a record outright. Compensation for a submission whose
    /// queue append failed; the job must never have been delivered.
    async fn remove(&self, job_id: Uuid) -> Result<()>;

    /// Atomically take ownership: Queued -> Running with `worker_id` set.
    /// Fails with `ClaimConflict` if the job has left Queued.
    async fn claim(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob>;

    /// Give up ownership without settling: Running -> Queued, conditioned
    /// on `worker_id` still owning the job. Used when the engine refuses
    /// to start and the entry goes back for redelivery.
    async fn release(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob>;

    /// Record progress while the job is Running or CancelRequested.
    /// Regressions are ignored so progress stays non-decreasing; writes
    /// against settled jobs are no-ops.
    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<TestJob>;

    /// Apply the cancellation state change for `cancel_test_run`.
    async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome>;

    /// Conditionally write a terminal state. The first terminal write wins;
    /// later writers observe `AlreadyTerminal`. Terminal writes from Queued
    /// (other than Cancelled) are illegal.
    async fn finish(&self, job_id: Uuid, kind: TerminalKind) -> Result<FinishOutcome>;

    /// Startup-only recovery: jobs stranded Running by a dead process go
    /// back to Queued (ownership cleared) so redelivered entries can be
    /// claimed again; stranded CancelRequested jobs settle as Cancelled.
    /// Must run before any worker is live.
    async fn recover_orphans(&self) -> Result<Vec<TestJob>>;
}
