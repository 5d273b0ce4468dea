//! Expiry jitter decorator
//!
//! Stretches every write TTL by a random factor in `[1, 2)` so entries written
//! together do not all expire together.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use rand::Rng;

use super::entry::CacheResult;
use super::store::{Expiry, SharedStore, Store};
use crate::error::Result;

/// Randomize a TTL as `t * (1 + U)`, `U ~ [0, 1)`. `None` stays `None`.
pub fn jittered(ttl: Expiry) -> Expiry {
    ttl.map(|t| {
        let factor: f64 = rand::thread_rng().gen_range(0.0..1.0);
        t + t.mul_f64(factor)
    })
}

/// Store that randomizes write TTLs
pub struct JitterStore<V: Send + 'static> {
    inner: SharedStore<V>,
}

impl<V: Send + 'static> JitterStore<V> {
    pub fn new(inner: SharedStore<V>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<V: Send + 'static> Store<V> for JitterStore<V> {
    async fn get(&self, key: &str) -> Result<CacheResult<V>> {
        self.inner.get(key).await
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        self.inner.get_all(keys).await
    }

    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()> {
        self.inner.put(key, value, jittered(ttl)).await
    }

    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()> {
        self.inner.put_all(values, jittered(ttl)).await
    }

    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool> {
        self.inner.put_if_absent(key, jittered(ttl)).await
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>> {
        self.inner.put_all_if_absent(keys, jittered(ttl)).await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.inner.remove(key).await
    }

    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()> {
        self.inner.remove_all(keys).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
