use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{JobStatus, TestJob};
use crate::store::{CancelOutcome, FinishOutcome, StateStore, TerminalKind};

/// In-memory state store, also the record-keeping core that
/// [`JsonStateStore`](crate::store::JsonStateStore) journals around.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    jobs: RwLock<HashMap<Uuid, TestJob>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a record verbatim, last write wins. Used by journal replay.
    pub(crate) async fn load(&self, job: TestJob) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Drop a record if present. Used by journal replay.
    pub(crate) async fn evict(&self, job_id: Uuid) {
        self.jobs.write().await.remove(&job_id);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn insert(&self, job: TestJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Internal(format!("duplicate job id {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<TestJob> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    async fn project_jobs(&self, project_id: &str) -> Result<Vec<TestJob>> {
        let jobs = self.jobs.read().await;
        let mut out: Vec<TestJob> = jobs
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        self.jobs
            .write()
            .await
            .remove(&job_id)
            .map(|_| ())
            .ok_or(Error::JobNotFound(job_id))
    }

    async fn claim(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        if job.status != JobStatus::Queued {
            return Err(Error::ClaimConflict {
                job_id,
                status: job.status,
            });
        }
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id);
        job.progress = 0;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn release(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        if job.status != JobStatus::Running || job.worker_id != Some(worker_id) {
            return Err(Error::ClaimConflict {
                job_id,
                status: job.status,
            });
        }
        job.status = JobStatus::Queued;
        job.worker_id = None;
        job.progress = 0;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<TestJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        if matches!(job.status, JobStatus::Running | JobStatus::CancelRequested) {
            let progress = progress.min(100);
            if progress > job.progress {
                job.progress = progress;
                job.updated_at = Utc::now();
            }
        }
        Ok(job.clone())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        let outcome = match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.updated_at = Utc::now();
                CancelOutcome::CancelledBeforeDispatch(job.clone())
            }
            JobStatus::Running | JobStatus::CancelRequested => {
                job.status = JobStatus::CancelRequested;
                job.updated_at = Utc::now();
                CancelOutcome::CancelRequested(job.clone())
            }
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::Failed => {
                CancelOutcome::AlreadyTerminal(job.clone())
            }
        };
        Ok(outcome)
    }

    async fn finish(&self, job_id: Uuid, kind: TerminalKind) -> Result<FinishOutcome> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(FinishOutcome::AlreadyTerminal(job.clone()));
        }

        let target = match &kind {
            TerminalKind::Completed { .. } => JobStatus::Completed,
            TerminalKind::Failed(_) => JobStatus::Failed,
            TerminalKind::Cancelled => JobStatus::Cancelled,
        };
        if !job.status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status,
                to: target,
            });
        }

        match kind {
            TerminalKind::Completed { output, artifacts } => {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.output = Some(output);
                job.artifacts = artifacts;
            }
            TerminalKind::Failed(failure) => {
                job.status = JobStatus::Failed;
                job.error = Some(failure);
            }
            TerminalKind::Cancelled => {
                job.status = JobStatus::Cancelled;
            }
        }
        job.updated_at = Utc::now();
        Ok(FinishOutcome::Applied(job.clone()))
    }

    async fn recover_orphans(&self) -> Result<Vec<TestJob>> {
        let mut jobs = self.jobs.write().await;
        let mut recovered = Vec::new();
        for job in jobs.values_mut() {
            match job.status {
                JobStatus::Running => {
                    job.status = JobStatus::Queued;
                    job.worker_id = None;
                    job.progress = 0;
                    job.updated_at = Utc::now();
                    recovered.push(job.clone());
                }
                JobStatus::CancelRequested => {
                    job.status = JobStatus::Cancelled;
                    job.worker_id = None;
                    job.updated_at = Utc::now();
                    recovered.push(job.clone());
                }
                _ => {}
            }
        }
        Ok(recovered)
    }
}
