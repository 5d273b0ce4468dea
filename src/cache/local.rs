//! Local Store - in-process bounded tier
//!
//! Size-bounded sharded map holding encoded envelopes, with expiry enforced
//! by a background sweeper rather than by reads alone.
//!
//! # Design
//!
//! - `ShardedMap` with 64 shards; put-if-absent is atomic per shard
//! - Every TTL'd write registers `(expire_at, key)` in a time-ordered index
//! - The sweeper wakes every `sweep_interval` (1s by default) and deletes
//!   every registered key whose deadline has passed, so a lock written with
//!   put-if-absent disappears at its TTL even with no read traffic
//! - Reads still treat expired entries as absent between sweeps
//! - Capacity is an entry count; overflow evicts expired entries first, then
//!   the least recently/frequently used

use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::codec::{JsonCodec, ValueCodec};
use super::entry::{expire_at, is_expired_at, now_millis, CacheHolder, CacheResult};
use super::shard::ShardedMap;
use super::store::{Expiry, Store};
use crate::error::Result;

/// Number of shards in the local store
pub const LOCAL_SHARD_COUNT: usize = 64;

/// Default sweep cadence
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Local store configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// How often the sweeper wakes
    pub sweep_interval: Duration,
    /// Fraction of `max_entries` eviction shrinks down to
    pub low_watermark: f64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            low_watermark: 0.90,
        }
    }
}

/// Stored payload plus access bookkeeping
#[derive(Debug)]
struct LocalEntry {
    payload: Bytes,
    expire_at: i64,
    last_access: AtomicI64,
    access_count: AtomicU32,
}

impl LocalEntry {
    fn new(payload: Bytes, expire_at: i64, now: i64) -> Self {
        Self {
            payload,
            expire_at,
            last_access: AtomicI64::new(now),
            access_count: AtomicU32::new(1),
        }
    }

    #[inline]
    fn is_expired(&self, now: i64) -> bool {
        is_expired_at(self.expire_at, now)
    }

    fn record_access(&self, now: i64) {
        self.last_access.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Higher = more evictable. Age over frequency, as LRU-K approximates it.
    fn eviction_score(&self, now: i64) -> f64 {
        if self.is_expired(now) {
            return f64::MAX;
        }
        let age = (now - self.last_access.load(Ordering::Relaxed)).max(0) as f64;
        let frequency = self.access_count.load(Ordering::Relaxed) as f64;
        age / (frequency + 1.0)
    }
}

/// State shared between the store handle and its sweeper task
struct LocalInner {
    storage: ShardedMap<String, Arc<LocalEntry>, LOCAL_SHARD_COUNT>,
    expiry_index: Mutex<BTreeMap<i64, HashSet<String>>>,
    config: LocalConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalInner {
    fn new(config: LocalConfig) -> Self {
        Self {
            storage: ShardedMap::new(),
            expiry_index: Mutex::new(BTreeMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn read(&self, key: &str, now: i64) -> Option<Bytes> {
        match self.storage.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_access(now);
                Some(entry.payload.clone())
            }
            _ => None,
        }
    }

    /// Counted once the payload is decoded, so lock sentinels are misses
    fn record_read(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn write(&self, key: String, payload: Bytes, expire_at: i64, now: i64) {
        self.ensure_capacity(now);
        self.register(&key, expire_at);
        self.storage
            .insert(key, Arc::new(LocalEntry::new(payload, expire_at, now)));
    }

    /// Atomic create: succeeds when the key is missing or its entry expired
    fn write_if_absent(&self, key: &str, payload: Bytes, expire_at: i64, now: i64) -> bool {
        self.ensure_capacity(now);
        let entry = Arc::new(LocalEntry::new(payload, expire_at, now));
        let created = self
            .storage
            .insert_if(key.to_string(), entry, |existing| existing.is_expired(now));
        if created {
            self.register(key, expire_at);
        }
        created
    }

    fn register(&self, key: &str, expire_at: i64) {
        if expire_at == 0 {
            return;
        }
        self.expiry_index
            .lock()
            .entry(expire_at)
            .or_default()
            .insert(key.to_string());
    }

    /// Remove every registered key whose deadline is at or before `now`.
    ///
    /// A key re-written with a later deadline since its registration is left
    /// alone; its newer registration will collect it.
    fn sweep(&self, now: i64) -> usize {
        let due = {
            let mut index = self.expiry_index.lock();
            let pending = index.split_off(&now.saturating_add(1));
            std::mem::replace(&mut *index, pending)
        };

        let mut removed = 0;
        for key in due.into_values().flatten() {
            if self
                .storage
                .remove_if(key.as_str(), |entry| entry.is_expired(now))
                .is_some()
            {
                removed += 1;
            }
        }
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn ensure_capacity(&self, now: i64) {
        if self.storage.len() < self.config.max_entries {
            return;
        }

        let target = ((self.config.max_entries as f64) * self.config.low_watermark) as usize;
        let mut candidates: Vec<(String, f64)> = Vec::new();
        for i in 0..self.storage.shard_count() {
            for (key, entry) in self.storage.shard(i).entries() {
                candidates.push((key, entry.eviction_score(now)));
            }
        }
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (key, _) in candidates {
            if self.storage.len() <= target.min(self.config.max_entries.saturating_sub(1)) {
                break;
            }
            if self.storage.remove(key.as_str()).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to a running sweeper task
struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Local store statistics
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStats {
    /// Number of entries (including not-yet-swept expired ones)
    pub entries: usize,
    /// Configured capacity
    pub max_entries: usize,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Entries evicted for capacity
    pub evictions: u64,
    /// Entries removed by the sweeper
    pub expirations: u64,
}

/// In-process bounded store
pub struct LocalStore<V, C = JsonCodec> {
    inner: Arc<LocalInner>,
    codec: C,
    sweeper: Mutex<Option<Sweeper>>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> LocalStore<V, JsonCodec> {
    /// Create a store with default configuration and the JSON codec
    pub fn new() -> Self {
        Self::with_config(LocalConfig::default())
    }

    /// Create a store with custom configuration and the JSON codec
    pub fn with_config(config: LocalConfig) -> Self {
        Self::with_codec(config, JsonCodec)
    }
}

impl<V> Default for LocalStore<V, JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, C> LocalStore<V, C> {
    /// Create a store with custom configuration and codec
    pub fn with_codec(config: LocalConfig, codec: C) -> Self {
        Self {
            inner: Arc::new(LocalInner::new(config)),
            codec,
            sweeper: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Spawn the expiry sweeper on the current tokio runtime.
    ///
    /// Calling `start` on a running store is a no-op.
    pub fn start(&self) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let interval = inner.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = inner.sweep(now_millis());
                        if removed > 0 {
                            debug!(removed, "Swept expired local entries");
                        }
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Local store sweeper started");
        *slot = Some(Sweeper { cancel, handle });
    }

    /// Stop the sweeper and wait for it to exit
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.cancel.cancel();
            if let Err(e) = sweeper.handle.await {
                debug!(error = %e, "Sweeper task ended abnormally");
            }
            info!("Local store sweeper stopped");
        }
    }

    /// Whether the sweeper is running
    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Run one sweep now; returns the number of entries removed
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep(now_millis())
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.inner.storage.clear();
        self.inner.expiry_index.lock().clear();
    }

    /// Number of physically present entries
    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    /// Get store statistics
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.len(),
            max_entries: self.inner.config.max_entries,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            expirations: self.inner.expirations.load(Ordering::Relaxed),
        }
    }

    fn decode(&self, key: &str, payload: &[u8]) -> CacheResult<V>
    where
        C: ValueCodec<V>,
    {
        match self.codec.decode(payload) {
            Ok(holder) => holder.into_result(),
            Err(e) => {
                debug!(key = %key, error = %e, "Undecodable local payload, treating as miss");
                CacheResult::miss()
            }
        }
    }
}

impl<V, C> Drop for LocalStore<V, C> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.cancel.cancel();
        }
    }
}

fn lock_token() -> Bytes {
    Bytes::from(format!("lock:{}", Uuid::new_v4()))
}

#[async_trait]
impl<V, C> Store<V> for LocalStore<V, C>
where
    V: Send + Sync + 'static,
    C: ValueCodec<V> + 'static,
{
    async fn get(&self, key: &str) -> Result<CacheResult<V>> {
        let result = match self.inner.read(key, now_millis()) {
            Some(payload) => self.decode(key, &payload),
            None => CacheResult::miss(),
        };
        self.inner.record_read(result.is_success());
        Ok(result)
    }

    async fn get_all(&self, keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<V>>> {
        let now = now_millis();
        Ok(keys
            .iter()
            .map(|key| {
                let result = match self.inner.read(key, now) {
                    Some(payload) => self.decode(key, &payload),
                    None => CacheResult::miss(),
                };
                self.inner.record_read(result.is_success());
                (key.clone(), result)
            })
            .collect())
    }

    async fn put(&self, key: &str, value: V, ttl: Expiry) -> Result<()> {
        let holder = CacheHolder::new(value, ttl);
        let payload = self.codec.encode(&holder)?;
        self.inner
            .write(key.to_string(), payload, holder.expire_at, now_millis());
        Ok(())
    }

    async fn put_all(&self, values: HashMap<String, V>, ttl: Expiry) -> Result<()> {
        let deadline = expire_at(ttl);
        let encoded = values
            .into_iter()
            .map(|(key, value)| {
                let payload = self.codec.encode(&CacheHolder::with_expire_at(value, deadline))?;
                Ok((key, payload))
            })
            .collect::<Result<Vec<_>>>()?;

        let now = now_millis();
        for (key, payload) in encoded {
            self.inner.write(key, payload, deadline, now);
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, ttl: Expiry) -> Result<bool> {
        Ok(self
            .inner
            .write_if_absent(key, lock_token(), expire_at(ttl), now_millis()))
    }

    async fn put_all_if_absent(&self, keys: &HashSet<String>, ttl: Expiry) -> Result<HashSet<String>> {
        let deadline = expire_at(ttl);
        let now = now_millis();
        let token = lock_token();
        Ok(keys
            .iter()
            .filter(|key| self.inner.write_if_absent(key, token.clone(), deadline, now))
            .cloned()
            .collect())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.inner.storage.remove(key).is_some())
    }

    async fn remove_all(&self, keys: &HashSet<String>) -> Result<()> {
        for key in keys {
            self.inner.storage.remove(key.as_str());
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// =============================================================================
// Tests
// =============================================================================
