use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::{JobLog, MemoryJobLog, QueueEntry};

/// One line of the queue journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Entry(QueueEntry),
    Ack { job_id: Uuid },
}

/// Append-only JSONL journal over [`MemoryJobLog`].
///
/// Appends and requeues write an `entry` line, settlement writes an `ack`
/// line. Opening the log replays the journal: every entry without a
/// matching ack (latest attempt wins) is pending again, which is what
/// gives redelivery after a crash.
pub struct FileJobLog {
    inner: MemoryJobLog,
    journal: Mutex<File>,
    path: PathBuf,
}

impl FileJobLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_capacity(path, 10_000).await
    }

    pub async fn open_with_capacity(path: impl AsRef<Path>, max_pending: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let inner = MemoryJobLog::with_capacity(max_pending);
        if tokio::fs::try_exists(&path).await? {
            for entry in Self::replay(&path).await? {
                inner.append(entry).await?;
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

    pub async fn pending(&self) -> usize {
        self.inner.len().await
    }

    /// Entries appended but never acked, in first-appearance order with the
    /// latest attempt for each job.
    async fn replay(path: &Path) -> Result<Vec<QueueEntry>> {
        let file = File::open(path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut entries: Vec<QueueEntry> = Vec::new();
        let mut acked: HashSet<Uuid> = HashSet::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(LogRecord::Entry(entry)) => {
                    if let Some(existing) = entries.iter_mut().find(|e| e.job_id == entry.job_id) {
                        *existing = entry;
                    } else {
                        entries.push(entry);
                    }
                }
                Ok(LogRecord::Ack { job_id }) => {
                    acked.insert(job_id);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable queue journal line");
                }
            }
        }

        entries.retain(|e| !acked.contains(&e.job_id));
        Ok(entries)
    }

    async fn journal_write(&self, record: &LogRecord) -> Result<()> {
        let mut file = self.journal.lock().await;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobLog for FileJobLog {
    async fn append(&self, entry: QueueEntry) -> Result<()> {
        self.journal_write(&LogRecord::Entry(entry.clone())).await?;
        self.inner.append(entry).await
    }

    async fn next(&self) -> Option<QueueEntry> {
        self.inner.next().await
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        self.journal_write(&LogRecord::Ack { job_id }).await
    }

    async fn requeue(&self, mut entry: QueueEntry) -> Result<()> {
        entry.attempt += 1;
        self.journal_write(&LogRecord::Entry(entry.clone())).await?;
        self.inner.append(entry).await
    }

    fn close(&self) {
        self.inner.close();
    }
}
