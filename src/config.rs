//! Cache configuration
//!
//! Settings for the standard two-tier chain (in-process store in front of an
//! optional Redis store) and the assembly of that chain into a
//! [`TieredCache`].

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{
    DefaultExpiry, DefaultExpiryStore, ExpiryUnit, FailoverStore, JitterStore, LocalConfig,
    LocalStore, RedisConfig, RedisStore, ResolverOptions, SharedStore, TieredCache,
    DEFAULT_SWEEP_INTERVAL,
};
use crate::error::{Error, Result};

/// In-process tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalTierConfig {
    /// TTL for writes that carry none
    pub default_expiry: DefaultExpiry,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Sweeper cadence in milliseconds
    pub sweep_interval_ms: u64,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            default_expiry: DefaultExpiry::new(60, ExpiryUnit::Seconds),
            max_entries: 10_000,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

/// Networked tier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTierConfig {
    /// TTL for writes that carry none
    pub default_expiry: DefaultExpiry,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            default_expiry: DefaultExpiry::new(60, ExpiryUnit::Minutes),
        }
    }
}

/// Top-level cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfiguration {
    pub local: LocalTierConfig,
    pub remote: RemoteTierConfig,
    /// Redis connection; no networked tier when absent
    pub redis: Option<RedisConfig>,
    pub resolver: ResolverOptions,
    /// Randomize write TTLs to spread expiry
    pub jitter: bool,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            remote: RemoteTierConfig::default(),
            redis: None,
            resolver: ResolverOptions::default(),
            jitter: true,
        }
    }
}

impl CacheConfiguration {
    /// Local tier only
    pub fn local_only() -> Self {
        Self::default()
    }

    /// Local tier in front of Redis at `url`
    pub fn with_redis(url: impl Into<String>) -> Self {
        Self {
            redis: Some(RedisConfig {
                url: url.into(),
                ..RedisConfig::default()
            }),
            ..Self::local_only()
        }
    }

    /// Check the configuration for values the stores cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.local.max_entries == 0 {
            return Err(Error::Config("local.max_entries must be positive".into()));
        }
        if self.local.sweep_interval_ms == 0 {
            return Err(Error::Config("local.sweep_interval_ms must be positive".into()));
        }
        if self.local.default_expiry.amount == 0 {
            return Err(Error::Config("local.default_expiry must be positive".into()));
        }
        if self.remote.default_expiry.amount == 0 {
            return Err(Error::Config("remote.default_expiry must be positive".into()));
        }
        if self.resolver.lock_ttl.is_zero() {
            return Err(Error::Config("resolver.lock_ttl must be positive".into()));
        }
        if let Some(redis) = &self.redis {
            if redis.url.is_empty() {
                return Err(Error::Config("redis.url must not be empty".into()));
            }
            if redis.pool_size == 0 {
                return Err(Error::Config("redis.pool_size must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn local_store_config(&self) -> LocalConfig {
        LocalConfig {
            max_entries: self.local.max_entries,
            sweep_interval: Duration::from_millis(self.local.sweep_interval_ms),
            ..LocalConfig::default()
        }
    }

    /// Wrap a raw store as a tier: jitter, then default expiry, then failover
    pub fn decorate<V>(&self, store: SharedStore<Vec<V>>, default_expiry: DefaultExpiry) -> SharedStore<Vec<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let store = if self.jitter {
            Arc::new(JitterStore::new(store)) as SharedStore<Vec<V>>
        } else {
            store
        };
        let store = Arc::new(DefaultExpiryStore::new(store, default_expiry));
        Arc::new(FailoverStore::new(store))
    }

    /// Build the tier chain and its resolver.
    ///
    /// Starts the local store's sweeper, so this must run inside a tokio
    /// runtime. Call [`CacheTiers::shutdown`] to stop it.
    pub async fn build_tiers<V>(&self) -> Result<CacheTiers<V>>
    where
        V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.validate()?;

        let local: Arc<LocalStore<Vec<V>>> =
            Arc::new(LocalStore::with_config(self.local_store_config()));
        local.start();
        let mut tiers = vec![self.decorate(local.clone(), self.local.default_expiry)];

        if let Some(redis) = &self.redis {
            let remote: RedisStore<Vec<V>> = RedisStore::connect(redis).await?;
            tiers.push(self.decorate(Arc::new(remote), self.remote.default_expiry));
        }

        info!(
            tiers = tiers.len(),
            max_entries = self.local.max_entries,
            redis = self.redis.is_some(),
            jitter = self.jitter,
            "Cache tiers ready"
        );
        Ok(CacheTiers {
            cache: Arc::new(TieredCache::with_options(tiers, self.resolver.clone())),
            local,
        })
    }
}

/// A built tier chain plus the handles needed to shut it down
pub struct CacheTiers<V: Clone + Send + Sync + 'static> {
    cache: Arc<TieredCache<V>>,
    local: Arc<LocalStore<Vec<V>>>,
}

impl<V: Clone + Send + Sync + 'static> CacheTiers<V> {
    /// The resolver over the chain
    pub fn cache(&self) -> &Arc<TieredCache<V>> {
        &self.cache
    }

    /// The undecorated local tier
    pub fn local(&self) -> &LocalStore<Vec<V>> {
        &self.local
    }

    /// Stop the local sweeper and wait for it to exit
    pub async fn shutdown(&self) {
        self.local.stop().await;
        info!("Cache tiers shut down");
    }
}
