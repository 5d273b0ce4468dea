//! Advisory load locks
//!
//! A lock is an ordinary TTL'd entry created with put-if-absent under a key
//! derived from the cache key. Whoever creates it loads; everyone else backs
//! off and re-reads. The TTL bounds how long a crashed holder can block
//! others.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, warn};

use super::store::SharedStore;

/// How long a lock survives if its holder never releases it
pub const LOCK_TTL: Duration = Duration::from_secs(10);

/// Pause between lock attempts when another caller holds the lock
pub const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Lock key for a cache key
#[inline]
pub fn lock_key(cache_key: &str) -> String {
    format!("${}$lock", cache_key)
}

/// Locks acquired on one tier, released together.
///
/// Call [`LockGuard::release`] on every normal path. If the guard is dropped
/// unreleased (the resolving future was cancelled), the removal is spawned
/// onto the current runtime instead.
pub struct LockGuard<V: Send + 'static> {
    store: SharedStore<V>,
    keys: HashSet<String>,
}

impl<V: Send + 'static> LockGuard<V> {
    pub fn new(store: SharedStore<V>, keys: HashSet<String>) -> Self {
        Self { store, keys }
    }

    pub fn single(store: SharedStore<V>, key: String) -> Self {
        Self::new(store, HashSet::from([key]))
    }

    pub fn keys(&self) -> &HashSet<String> {
        &self.keys
    }

    /// Delete the lock entries. Failures are logged; the TTL reclaims them.
    pub async fn release(mut self) {
        let keys = std::mem::take(&mut self.keys);
        remove_locks(&self.store, keys).await;
    }
}

async fn remove_locks<V: Send + 'static>(store: &SharedStore<V>, keys: HashSet<String>) {
    let result = match keys.len() {
        0 => return,
        1 => match keys.iter().next() {
            Some(key) => store.remove(key).await.map(|_| ()),
            None => return,
        },
        _ => store.remove_all(&keys).await,
    };
    match result {
        Ok(()) => debug!(store = store.name(), count = keys.len(), "Released load locks"),
        Err(e) => warn!(
            store = store.name(),
            count = keys.len(),
            error = %e,
            "Failed to release load locks, leaving them to expire"
        ),
    }
}

impl<V: Send + 'static> Drop for LockGuard<V> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let keys = std::mem::take(&mut self.keys);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    remove_locks(&store, keys).await;
                });
            }
            Err(_) => warn!(
                count = keys.len(),
                "Load locks dropped outside a runtime, leaving them to expire"
            ),
        }
    }
}
