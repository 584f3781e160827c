//! Process-wide serialization of repository mutations.
//!
//! All three repository formats write into the same mounted root, and both
//! the remount step and the Debian transaction assume no sibling writer.
//! Every publish worker must therefore hold the single [`UpdateGate`] across
//! its whole repository-mutation phase. The gate is an explicit injectable
//! handle rather than a module-level singleton so tests can observe the
//! serialization.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Cloneable handle to the process-wide repository update lock.
#[derive(Clone)]
pub struct UpdateGate {
    inner: Arc<Mutex<()>>,
}

/// Guard proving the gate is held; repository mutation is only safe while
/// this is alive.
pub struct UpdateGuard {
    _guard: OwnedMutexGuard<()>,
}

impl UpdateGate {
    /// Create a fresh gate. One instance is shared by all workers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
        }
    }

    /// Wait for exclusive access. Waiters proceed in whatever order the
    /// underlying mutex grants; no timeout is applied.
    pub async fn acquire(&self) -> UpdateGuard {
        UpdateGuard {
            _guard: Arc::clone(&self.inner).lock_owned().await,
        }
    }

    /// Whether some worker currently holds the gate. Only used for logging;
    /// the answer may be stale by the time the caller acts on it.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

impl Default for UpdateGate {
    fn default() -> Self {
        Self::new()
    }
}
