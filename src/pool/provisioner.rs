//! Provisioner seam: how the pool creates, destroys and inspects compute.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProvisionError;

/// A freshly created worker as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorker {
    /// Provider-specific handle for later destroy/status calls.
    pub handle: String,
    pub address: String,
}

/// Provider-reported state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Running,
    /// Still present on the provider but not running.
    Stopped,
    /// Gone from the provider.
    Missing,
}

/// Creates and destroys compute workers on some provider.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provider name for logs (e.g. "local", "fly").
    fn name(&self) -> &str;

    async fn create(&self) -> Result<ProvisionedWorker, ProvisionError>;

    async fn destroy(&self, handle: &str) -> Result<(), ProvisionError>;

    async fn status(&self, handle: &str) -> Result<RemoteState, ProvisionError>;
}

/// In-process provisioner. Workers are plain slots; useful for running the
/// binary on one machine and for tests.
#[derive(Default)]
pub struct LocalProvisioner {
    next_id: AtomicU64,
    workers: Mutex<HashMap<String, RemoteState>>,
    fail_creates: AtomicUsize,
    fail_destroys: AtomicUsize,
}

impl LocalProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` destroy calls fail.
    pub fn fail_next_destroys(&self, n: usize) {
        self.fail_destroys.store(n, Ordering::SeqCst);
    }

    /// Simulate the provider stopping a worker behind the pool's back.
    /// With `remove`, the worker disappears entirely.
    pub async fn terminate(&self, handle: &str, remove: bool) {
        let mut workers = self.workers.lock().await;
        if remove {
            workers.remove(handle);
        } else if let Some(state) = workers.get_mut(handle) {
            *state = RemoteState::Stopped;
        }
    }

    /// Number of workers currently known to the provider.
    pub async fn live_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(&self) -> Result<ProvisionedWorker, ProvisionError> {
        if Self::take_failure(&self.fail_creates) {
            return Err(ProvisionError::CreateFailed {
                reason: "injected failure".to_string(),
            });
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = format!("local-{n}");
        self.workers
            .lock()
            .await
            .insert(handle.clone(), RemoteState::Running);

        debug!(handle = %handle, "Local worker created");
        Ok(ProvisionedWorker {
            address: format!("local://worker-{n}"),
            handle,
        })
    }

    async fn destroy(&self, handle: &str) -> Result<(), ProvisionError> {
        if Self::take_failure(&self.fail_destroys) {
            return Err(ProvisionError::DestroyFailed {
                handle: handle.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        self.workers.lock().await.remove(handle);
        debug!(handle, "Local worker destroyed");
        Ok(())
    }

    async fn status(&self, handle: &str) -> Result<RemoteState, ProvisionError> {
        Ok(self
            .workers
            .lock()
            .await
            .get(handle)
            .copied()
            .unwrap_or(RemoteState::Missing))
    }
}
