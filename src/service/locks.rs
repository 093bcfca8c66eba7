use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per container name.
///
/// Restarts of the same container serialize on its lock, restarts of
/// different containers do not contend.
#[derive(Default)]
pub struct RestartLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RestartLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, container: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Nobody holds or waits on an entry whose only reference is the map
            inner.retain(|name, lock| name == container || Arc::strong_count(lock) > 1);
            Arc::clone(inner.entry(container.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Whether a restart for `container` is currently in flight.
    pub fn is_locked(&self, container: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(container)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
