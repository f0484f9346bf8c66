use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-job cancellation markers.
///
/// The worker that claims a job registers a token here and watches it
/// before starting the engine and at every progress checkpoint. A cancel
/// request addressed to a job the registry does not know (never claimed,
/// or already settled and deregistered) is a no-op — the store-side state
/// change is what makes cancellation stick.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job at claim time. Returns the token the owning worker
    /// must watch.
    pub async fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(job_id, token.clone());
        token
    }

    /// Fire the cancellation marker for a job, if it is registered.
    pub async fn request(&self, job_id: Uuid) {
        if let Some(token) = self.tokens.lock().await.get(&job_id) {
            token.cancel();
        }
    }

    /// Drop a job's token once it has settled.
    pub async fn deregister(&self, job_id: Uuid) {
        self.tokens.lock().await.remove(&job_id);
    }

    pub async fn is_registered(&self, job_id: Uuid) -> bool {
        self.tokens.lock().await.contains_key(&job_id)
    }
}
