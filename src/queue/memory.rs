use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::queue::{JobLog, QueueEntry};

const DEFAULT_MAX_PENDING: usize = 10_000;

/// In-memory competing-consumer queue. Delivery only; durability is the
/// concern of [`FileJobLog`](crate::queue::FileJobLog), which wraps this.
pub struct MemoryJobLog {
    pending: Mutex<VecDeque<QueueEntry>>,
    notify: Notify,
    closed: CancellationToken,
    max_pending: usize,
}

impl Default for MemoryJobLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_PENDING)
    }

    pub fn with_capacity(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: CancellationToken::new(),
            max_pending,
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    async fn push(&self, entry: QueueEntry) -> Result<()> {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            return Err(Error::QueueUnavailable(format!(
                "queue at capacity ({} entries)",
                self.max_pending
            )));
        }
        pending.push_back(entry);
        drop(pending);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl JobLog for MemoryJobLog {
    async fn append(&self, entry: QueueEntry) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::QueueUnavailable("queue is closed".to_string()));
        }
        self.push(entry).await
    }

    async fn next(&self) -> Option<QueueEntry> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            if let Some(entry) = self.pending.lock().await.pop_front() {
                return Some(entry);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    async fn ack(&self, _job_id: Uuid) -> Result<()> {
        // Nothing to settle: delivery already removed the entry and there
        // is no journal behind this log.
        Ok(())
    }

    async fn requeue(&self, mut entry: QueueEntry) -> Result<()> {
        entry.attempt += 1;
        self.push(entry).await
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobKind, TestJob};
    use serde_json::json;

    fn entry() -> QueueEntry {
        let job = TestJob::new(JobKind::AlgorithmTest, "g", "c", "p", json!({}));
        QueueEntry::for_job(&job)
    }

    #[tokio::test]
    async fn delivers_in_append_order() {
        let log = MemoryJobLog::new();
        let a = entry();
        let b = entry();
        log.append(a.clone()).await.unwrap();
        log.append(b.clone()).await.unwrap();

        assert_eq!(log.next().await.unwrap().job_id, a.job_id);
        assert_eq!(log.next().await.unwrap().job_id, b.job_id);
    }

    #[tokio::test]
    async fn each_entry_goes_to_one_consumer() {
        let log = std::sync::Arc::new(MemoryJobLog::new());
        for _ in 0..20 {
            log.append(entry()).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(e) = {
                    let got = log.pending.lock().await.pop_front();
                    got
                } {
                    seen.push(e.job_id);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20, "no entry may be delivered twice");
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers() {
        let log = std::sync::Arc::new(MemoryJobLog::new());
        let waiter = {
            let log = log.clone();
            tokio::spawn(async move { log.next().await })
        };
        tokio::task::yield_now().await;
        log.close();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn capacity_limit_surfaces_unavailable() {
        let log = MemoryJobLog::with_capacity(1);
        log.append(entry()).await.unwrap();
        let err = log.append(entry()).await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn requeue_bumps_attempt() {
        let log = MemoryJobLog::new();
        log.append(entry()).await.unwrap();
        let e = log.next().await.unwrap();
        assert_eq!(e.attempt, 0);
        log.requeue(e).await.unwrap();
        let e = log.next().await.unwrap();
        assert_eq!(e.attempt, 1);
    }
}
