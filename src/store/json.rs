use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::job::TestJob;
use crate::store::{CancelOutcome, FinishOutcome, MemoryStateStore, StateStore, TerminalKind};

/// One line of the state journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Upsert(TestJob),
    Remove { job_id: Uuid },
}

/// Disk-backed state store: an in-memory record map journaled to a JSONL
/// file. Each mutation writes the full record as an `upsert` line (last
/// write wins on replay); compensating deletions write a `remove` line.
///
/// Mutations run under a single journal lock so the on-disk order matches
/// the in-memory order; the CAS discipline itself lives in
/// [`MemoryStateStore`].
pub struct JsonStateStore {
    inner: MemoryStateStore,
    journal: Mutex<File>,
    path: PathBuf,
}

impl JsonStateStore {
    /// Open the journal at `path`, replaying any existing records.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let inner = MemoryStateStore::new();
        if tokio::fs::try_exists(&path).await? {
            let file = File::open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(&line) {
                    Ok(JournalRecord::Upsert(job)) => inner.load(job).await,
                    Ok(JournalRecord::Remove { job_id }) => inner.evict(job_id).await,
                    Err(e) => {
                        // A torn final line from a crash mid-append is
                        // expected; anything else is worth seeing.
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable journal line");
                    }
                }
            }
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            inner,
            journal: Mutex::new(journal),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn journal_record(&self, file: &mut File, job: &TestJob) -> Result<()> {
        self.journal_write(file, &JournalRecord::Upsert(job.clone()))
            .await
    }

    async fn journal_write(&self, file: &mut File, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn insert(&self, job: TestJob) -> Result<()> {
        let mut file = self.journal.lock().await;
        self.inner.insert(job.clone()).await?;
        self.journal_record(&mut file, &job).await
    }

    async fn get(&self, job_id: Uuid) -> Result<TestJob> {
        self.inner.get(job_id).await
    }

    async fn project_jobs(&self, project_id: &str) -> Result<Vec<TestJob>> {
        self.inner.project_jobs(project_id).await
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let mut file = self.journal.lock().await;
        self.inner.remove(job_id).await?;
        self.journal_write(&mut file, &JournalRecord::Remove { job_id })
            .await
    }

    async fn claim(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob> {
        let mut file = self.journal.lock().await;
        let job = self.inner.claim(job_id, worker_id).await?;
        self.journal_record(&mut file, &job).await?;
        Ok(job)
    }

    async fn release(&self, job_id: Uuid, worker_id: u64) -> Result<TestJob> {
        let mut file = self.journal.lock().await;
        let job = self.inner.release(job_id, worker_id).await?;
        self.journal_record(&mut file, &job).await?;
        Ok(job)
    }

    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<TestJob> {
        let mut file = self.journal.lock().await;
        let job = self.inner.set_progress(job_id, progress).await?;
        self.journal_record(&mut file, &job).await?;
        Ok(job)
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let mut file = self.journal.lock().await;
        let outcome = self.inner.request_cancel(job_id).await?;
        match &outcome {
            CancelOutcome::CancelledBeforeDispatch(job)
            | CancelOutcome::CancelRequested(job) => {
                self.journal_record(&mut file, job).await?;
            }
            CancelOutcome::AlreadyTerminal(_) => {}
        }
        Ok(outcome)
    }

    async fn finish(&self, job_id: Uuid, kind: TerminalKind) -> Result<FinishOutcome> {
        let mut file = self.journal.lock().await;
        let outcome = self.inner.finish(job_id, kind).await?;
        if let FinishOutcome::Applied(job) = &outcome {
            self.journal_record(&mut file, job).await?;
        }
        Ok(outcome)
    }

    async fn recover_orphans(&self) -> Result<Vec<TestJob>> {
        let mut file = self.journal.lock().await;
        let recovered = self.inner.recover_orphans().await?;
        for job in &recovered {
            self.journal_record(&mut file, job).await?;
        }
        Ok(recovered)
    }
}
