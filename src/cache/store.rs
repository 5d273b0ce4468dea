//! Store contract
//!
//! The primitive key/value contract every tier implements: TTL writes, batch
//! reads and writes, and an atomic put-if-absent used as an advisory lock.
//! Absence is always a `CacheResult::miss()`, never an error; errors are
//! reserved for backing-store failures.

use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::entry::CacheResult;
use crate::error::Result;

/// Time-to-live for a write. `None` = no expiry at the raw store.
pub type Expiry = Option<Duration>;

/// Shared, type-erased store handle
pub type SharedStore<V> = Arc<dyn Store<V>>;

/// Key/value store with TTL and atomic conditional writes.
///
/// Batch operations are equivalent to applying the single-key operation to
/// every key, but implementations may serve them in one round-trip.
#[async_trait]
pub trait Store<V: Send + 'static>: Send + Sync {
    /// Read one key
    async fn get(&self, key: &str) -> Result<CacheResult<V>>;

    /// Read many keys. Every input key appears in the output.
    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>>;

    /// Write one key
    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()>;

    /// Write many keys with the same TTL
    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()>;

    /// Create `key` with an opaque sentinel if it does not exist.
    /// Returns true iff this call created it.
    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool>;

    /// Conditional create for many keys; returns the keys this call created
    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>>;

    /// Remove one key
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Remove many keys
    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Store that holds nothing: reads miss, writes are dropped, and every
/// conditional create succeeds.
pub struct NoopStore<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> NoopStore<V> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for NoopStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for NoopStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NoopStore")
    }
}

#[async_trait]
impl<V: Send + 'static> Store<V> for NoopStore<V> {
    async fn get(&self, _key: &str) -> Result<CacheResult<V>> {
        Ok(CacheResult::miss())
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        Ok(keys
            .iter()
            .map(|k| (k.clone(), CacheResult::miss()))
            .collect())
    }

    async fn put(&self, _key: &str, _value: V, _ttl: Expiry) -> Result<()> {
        Ok(())
    }

    async fn put_all(&self, _values: HashMap<String, V>, _ttl: Expiry) -> Result<()> {
        Ok(())
    }

    async fn put_if_absent(&self, _key: &str, _ttl: Expiry) -> Result<bool> {
        Ok(true)
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, _ttl: Expiry) -> Result<HashSet<String>> {
        Ok(keys.clone())
    }

    async fn remove(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    async fn remove_all(&self, _keys: &HashSet<String>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// =============================================================================
// Tests
// =============================================================================
