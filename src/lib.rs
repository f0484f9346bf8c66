pub mod api;
pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod progress;
pub mod queue;
pub mod report;
pub mod schema;
pub mod service;
pub mod store;

pub use config::{EngineCommand, QueueConfig};
pub use error::{Error, Result};
pub use job::{FailureReason, JobFailure, JobKind, JobStatus, ProgressEvent, TestJob};
pub use service::{EngineQueue, TestRunSpec};
