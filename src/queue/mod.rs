//! Durable, replayable job-submission log.
//!
//! Each submission appends one [`QueueEntry`]; entries are consumed by a
//! competing-consumer group (the dispatcher workers), each delivered to
//! exactly one worker under normal operation. [`FileJobLog`] journals
//! appends and acks so entries never settled before a crash are redelivered
//! on the next start (at-least-once delivery). The claim CAS in the state
//! store turns at-least-once delivery into at-most-once execution.

pub mod log;
pub mod memory;

pub use log::FileJobLog;
pub use memory::MemoryJobLog;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::job::{JobKind, TestJob};

/// Wire shape of one queued submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: Uuid,
    pub project_id: String,
    pub kind: JobKind,
    pub gid: String,
    pub cid: String,
    pub arguments: Value,
    pub submitted_at: DateTime<Utc>,
    /// Delivery attempt, bumped on every requeue.
    pub attempt: u32,
}

impl QueueEntry {
    pub fn for_job(job: &TestJob) -> Self {
        Self {
            job_id: job.id,
            project_id: job.project_id.clone(),
            kind: job.kind,
            gid: job.gid.clone(),
            cid: job.cid.clone(),
            arguments: job.arguments.clone(),
            submitted_at: job.created_at,
            attempt: 0,
        }
    }
}

#[async_trait]
pub trait JobLog: Send + Sync {
    /// Append a submission entry. Fails with `QueueUnavailable` when the
    /// log cannot accept it (capacity or backing storage).
    async fn append(&self, entry: QueueEntry) -> Result<()>;

    /// Await the next deliverable entry. Returns `None` once the log has
    /// been closed; entries still pending at close are left for replay.
    async fn next(&self) -> Option<QueueEntry>;

    /// Settle an entry so it is never redelivered.
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    /// Hand an entry back for redelivery with its attempt count bumped.
    async fn requeue(&self, entry: QueueEntry) -> Result<()>;

    /// Stop delivery. Pending and in-flight `next` calls return `None`.
    fn close(&self);
}
