//! Default-expiry decorator
//!
//! Gives every write a TTL: callers passing no TTL (or a zero one) get the
//! tier's configured default instead.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::entry::CacheResult;
use super::store::{Expiry, SharedStore, Store};
use crate::error::Result;

/// Unit of a configured expiry amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl ExpiryUnit {
    /// Milliseconds in one unit
    pub const fn millis(self) -> u64 {
        match self {
            ExpiryUnit::Millis => 1,
            ExpiryUnit::Seconds => 1_000,
            ExpiryUnit::Minutes => 60_000,
            ExpiryUnit::Hours => 3_600_000,
            ExpiryUnit::Days => 86_400_000,
        }
    }
}

/// A TTL expressed as amount + unit, as it appears in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultExpiry {
    pub amount: u64,
    pub unit: ExpiryUnit,
}

impl DefaultExpiry {
    pub const fn new(amount: u64, unit: ExpiryUnit) -> Self {
        Self { amount, unit }
    }

    pub fn to_duration(self) -> Duration {
        Duration::from_millis(self.amount.saturating_mul(self.unit.millis()))
    }
}

/// Store that substitutes a default TTL for missing or zero TTLs
pub struct DefaultExpiryStore<V: Send + 'static> {
    inner: SharedStore<V>,
    default_ttl: Duration,
}

impl<V: Send + 'static> DefaultExpiryStore<V> {
    pub fn new(inner: SharedStore<V>, default: DefaultExpiry) -> Self {
        Self {
            inner,
            default_ttl: default.to_duration(),
        }
    }

    /// The TTL substituted for absent ones
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    #[inline]
    fn resolve(&self, ttl: Expiry) -> Expiry {
        match ttl {
            Some(t) if !t.is_zero() => Some(t),
            _ => Some(self.default_ttl),
        }
    }
}

#[async_trait]
impl<V: Send + 'static> Store<V> for DefaultExpiryStore<V> {
    async fn get(&self, key: &str) -> Result<CacheResult<V>> {
        self.inner.get(key).await
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        self.inner.get_all(keys).await
    }

    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()> {
        self.inner.put(key, value, self.resolve(ttl)).await
    }

    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()> {
        self.inner.put_all(values, self.resolve(ttl)).await
    }

    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool> {
        self.inner.put_if_absent(key, self.resolve(ttl)).await
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>> {
        self.inner.put_all_if_absent(keys, self.resolve(ttl)).await
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
