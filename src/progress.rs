use tokio::sync::broadcast;

use crate::job::{ProgressEvent, TestJob};

/// Broadcasts job status/progress transitions to subscribers.
///
/// Delivery is best-effort and at-most-once per write: the channel buffer
/// is bounded and lagging subscribers lose the oldest events, so readers
/// reconcile against the state store after a gap. An explicitly
/// constructed component, created with the service and dropped with it.
#[derive(Debug)]
pub struct ProgressPublisher {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressPublisher {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Emit an event for a freshly written job record. Fire-and-forget: an
    /// empty subscriber set is not an error.
    pub fn publish(&self, job: &TestJob) {
        let event = ProgressEvent {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
        };
        tracing::trace!(job_id = %event.job_id, status = %event.status, progress = event.progress, "Publishing progress event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
