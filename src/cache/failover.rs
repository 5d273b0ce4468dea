//! Failover decorator
//!
//! Runs every operation against a primary store. When the primary returns an
//! error, the error is logged and the same operation is replayed against the
//! fallback, whose result is returned. With the default no-op fallback a
//! broken tier degrades to "always miss, accept every write".

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::entry::CacheResult;
use super::store::{Expiry, NoopStore, SharedStore, Store};
use crate::error::Result;

/// Store that falls back to a secondary store on primary errors
pub struct FailoverStore<V: Send + 'static> {
    primary: SharedStore<V>,
    fallback: SharedStore<V>,
}

impl<V: Send + 'static> FailoverStore<V> {
    /// Wrap `primary` with a no-op fallback
    pub fn new(primary: SharedStore<V>) -> Self {
        Self::with_fallback(primary, Arc::new(NoopStore::new()))
    }

    /// Wrap `primary` with an explicit fallback
    pub fn with_fallback(primary: SharedStore<V>, fallback: SharedStore<V>) -> Self {
        Self { primary, fallback }
    }

    fn report(&self, op: &'static str, e: &crate::error::Error) {
        error!(
            store = self.primary.name(),
            fallback = self.fallback.name(),
            op,
            error = %e,
            "Primary store failed, using fallback"
        );
    }
}

#[async_trait]
impl<V> Store<V> for FailoverStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheResult<V>> {
        match self.primary.get(key).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.report("get", &e);
                self.fallback.get(key).await
            }
        }
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        match self.primary.get_all(keys).await {
            Ok(results) => Ok(results),
            Err(e) => {
                self.report("get_all", &e);
                self.fallback.get_all(keys).await
            }
        }
    }

    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()> {
        match self.primary.put(key, value.clone(), ttl).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report("put", &e);
                self.fallback.put(key, value, ttl).await
            }
        }
    }

    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()> {
        match self.primary.put_all(values.clone(), ttl).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report("put_all", &e);
                self.fallback.put_all(values, ttl).await
            }
        }
    }

    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool> {
        match self.primary.put_if_absent(key, ttl).await {
            Ok(created) => Ok(created),
            Err(e) => {
                self.report("put_if_absent", &e);
                self.fallback.put_if_absent(key, ttl).await
            }
        }
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>> {
        match self.primary.put_all_if_absent(keys, ttl).await {
            Ok(created) => Ok(created),
            Err(e) => {
                self.report("put_all_if_absent", &e);
                self.fallback.put_all_if_absent(keys, ttl).await
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        match self.primary.remove(key).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                self.report("remove", &e);
                self.fallback.remove(key).await
            }
        }
    }

    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()> {
        match self.primary.remove_all(keys).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.report("remove_all", &e);
                self.fallback.remove_all(keys).await
            }
        }
    }

    fn name(&self) -> &'static str {
        self.primary.name()
    }
}

// =============================================================================
// Tests
// =============================================================================
