use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments for algorithm {gid}/{cid}: {message}")]
    Validation {
        gid: String,
        cid: String,
        message: String,
    },

    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} already claimed (status {status})")]
    ClaimConflict { job_id: Uuid, status: JobStatus },

    #[error("Report generation failed for project {project_id}: {message}")]
    ReportGeneration { project_id: String, message: String },

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
