//! Tiered get-or-load resolver
//!
//! Walks an ordered list of stores, cheapest first. A miss on one tier takes
//! that tier's load lock and recurses into the next tier; only the last tier
//! calls the loader. Results are written back into every tier that missed on
//! the way down.
//!
//! # Stampede prevention
//!
//! - Reads always happen before lock attempts, and the cache is read again
//!   once the lock is held, so callers queued behind a load pick up its
//!   result instead of loading again
//! - Losing a lock race costs one backoff sleep, then the read is retried
//! - Locks are TTL'd entries; a holder that dies stalls others for at most
//!   the lock TTL
//!
//! The batch variant runs the same protocol over a working set of keys,
//! resolving whatever it can per round and locking the rest in one call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::lock::{LockGuard, LOCK_RETRY_BACKOFF, LOCK_TTL};
use super::metrics::ResolverMetrics;
use super::params::{ParamCombination, ParamPack};
use super::store::{Expiry, NoopStore, SharedStore};
use crate::error::{Error, Result};

/// Resolver tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// TTL of load locks
    pub lock_ttl: Duration,
    /// Sleep after a lost lock race
    pub retry_backoff: Duration,
    /// Batch rounds after which each further round logs a warning
    pub warn_after_iterations: u32,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            lock_ttl: LOCK_TTL,
            retry_backoff: LOCK_RETRY_BACKOFF,
            warn_after_iterations: 5,
        }
    }
}

/// Expiry settings for one cached operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CachePolicy {
    /// TTL for non-empty results
    pub expire: Expiry,
    /// TTL for cached empty results
    pub null_expire: Expiry,
    /// Whether empty results are cached at all
    pub cache_null: bool,
}

impl CachePolicy {
    pub fn new(expire: Duration) -> Self {
        Self {
            expire: Some(expire),
            ..Self::default()
        }
    }

    /// Also cache empty results for `null_expire`
    pub fn with_null_caching(mut self, null_expire: Duration) -> Self {
        self.cache_null = true;
        self.null_expire = Some(null_expire);
        self
    }
}

/// What a single-key loader produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Loaded<V> {
    Nothing,
    One(V),
    Many(Vec<V>),
}

impl<V> Loaded<V> {
    pub fn into_vec(self) -> Vec<V> {
        match self {
            Loaded::Nothing => Vec::new(),
            Loaded::One(value) => vec![value],
            Loaded::Many(values) => values,
        }
    }
}

impl<V> From<Option<V>> for Loaded<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(value) => Loaded::One(value),
            None => Loaded::Nothing,
        }
    }
}

impl<V> From<Vec<V>> for Loaded<V> {
    fn from(values: Vec<V>) -> Self {
        Loaded::Many(values)
    }
}

/// Closures a batch resolution threads through every tier
struct BatchContext<'a, E, L> {
    extractor: &'a E,
    loader: &'a L,
    policy: &'a CachePolicy,
}

/// Cache-aside resolver over an ordered chain of stores
pub struct TieredCache<V: Send + 'static> {
    tiers: Vec<SharedStore<Vec<V>>>,
    options: ResolverOptions,
    metrics: Arc<ResolverMetrics>,
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a resolver over `tiers`, first tier consulted first
    pub fn new(tiers: Vec<SharedStore<Vec<V>>>) -> Self {
        Self::with_options(tiers, ResolverOptions::default())
    }

    /// Create a resolver with custom options. No tiers means every call loads.
    pub fn with_options(mut tiers: Vec<SharedStore<Vec<V>>>, options: ResolverOptions) -> Self {
        if tiers.is_empty() {
            tiers.push(Arc::new(NoopStore::new()));
        }
        let metrics = Arc::new(ResolverMetrics::new(tiers.len()));
        Self {
            tiers,
            options,
            metrics,
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub fn tiers(&self) -> &[SharedStore<Vec<V>>] {
        &self.tiers
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    pub fn metrics(&self) -> &ResolverMetrics {
        &self.metrics
    }

    /// Resolve one parameter.
    ///
    /// Returns the cached or loaded values for `param`, empty when the
    /// loader found nothing. Loader errors come back as [`Error::Loader`].
    pub async fn get_or_load<P, K, L, Fut, R>(
        &self,
        param: P,
        key_builder: K,
        loader: L,
        policy: &CachePolicy,
    ) -> Result<Vec<V>>
    where
        P: Clone + Send + Sync,
        K: FnOnce(&P) -> String,
        L: Fn(P) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<R>> + Send,
        R: Into<Loaded<V>> + Send,
    {
        let pack = ParamPack::new(param, key_builder);
        self.resolve_one(0, &pack, &loader, policy).await
    }

    /// Resolve one parameter whose loader yields at most one value
    pub async fn get_or_load_one<P, K, L, Fut, R>(
        &self,
        param: P,
        key_builder: K,
        loader: L,
        policy: &CachePolicy,
    ) -> Result<Option<V>>
    where
        P: Clone + Send + Sync,
        K: FnOnce(&P) -> String,
        L: Fn(P) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<R>> + Send,
        R: Into<Loaded<V>> + Send,
    {
        let values = self.get_or_load(param, key_builder, loader, policy).await?;
        Ok(values.into_iter().next())
    }

    /// Resolve many parameters at once.
    ///
    /// `extractor` maps a loaded value back to the parameter it answers, so
    /// batch loader results can be filed under the right cache key. Values
    /// are returned in no particular order.
    pub async fn get_or_load_many<P, I, K, E, L, Fut>(
        &self,
        params: I,
        key_builder: K,
        extractor: E,
        loader: L,
        policy: &CachePolicy,
    ) -> Result<Vec<V>>
    where
        I: IntoIterator<Item = P>,
        P: Eq + Hash + Clone + Send + Sync,
        K: Fn(&P) -> String,
        E: Fn(&V) -> P + Sync,
        L: Fn(Vec<P>) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send,
    {
        let combination = ParamCombination::new(
            params
                .into_iter()
                .map(|param| ParamPack::new(param, &key_builder)),
        );
        if combination.is_empty() {
            return Ok(Vec::new());
        }

        let ctx = BatchContext {
            extractor: &extractor,
            loader: &loader,
            policy,
        };
        self.resolve_many(0, combination, &ctx).await
    }

    /// Delete `keys` from every tier
    pub async fn remove_cache(&self, keys: &HashSet<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for tier in &self.tiers {
            tier.remove_all(keys).await?;
        }
        debug!(count = keys.len(), tiers = self.tiers.len(), "Removed cache keys");
        Ok(())
    }

    async fn backoff(&self) {
        self.metrics.record_backoff();
        tokio::time::sleep(self.options.retry_backoff).await;
    }

    // -------------------------------------------------------------------------
    // Single key
    // -------------------------------------------------------------------------

    fn resolve_one<'a, P, L, Fut, R>(
        &'a self,
        tier: usize,
        pack: &'a ParamPack<P>,
        loader: &'a L,
        policy: &'a CachePolicy,
    ) -> BoxFuture<'a, Result<Vec<V>>>
    where
        P: Clone + Send + Sync,
        L: Fn(P) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'a,
        R: Into<Loaded<V>> + Send + 'a,
    {
        async move {
            let store = &self.tiers[tier];
            loop {
                let cached = store.get(&pack.cache_key).await?;
                if cached.is_success() {
                    self.metrics.record_hits(tier, 1);
                    return Ok(cached.into_data().unwrap_or_default());
                }

                if !store
                    .put_if_absent(&pack.lock_key, Some(self.options.lock_ttl))
                    .await?
                {
                    self.metrics.record_locks(0, 1);
                    self.backoff().await;
                    continue;
                }
                self.metrics.record_locks(1, 0);

                let guard = LockGuard::single(Arc::clone(store), pack.lock_key.clone());
                let outcome = self.load_one(tier, pack, loader, policy).await;
                guard.release().await;
                return outcome;
            }
        }
        .boxed()
    }

    /// Runs with `pack`'s lock held on `tier`
    async fn load_one<'a, P, L, Fut, R>(
        &'a self,
        tier: usize,
        pack: &'a ParamPack<P>,
        loader: &'a L,
        policy: &'a CachePolicy,
    ) -> Result<Vec<V>>
    where
        P: Clone + Send + Sync,
        L: Fn(P) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'a,
        R: Into<Loaded<V>> + Send + 'a,
    {
        let store = &self.tiers[tier];

        let cached = store.get(&pack.cache_key).await?;
        if cached.is_success() {
            debug!(key = %pack.cache_key, tier, "Value appeared while acquiring lock");
            self.metrics.record_hits(tier, 1);
            return Ok(cached.into_data().unwrap_or_default());
        }

        let data = if tier + 1 < self.tiers.len() {
            self.resolve_one(tier + 1, pack, loader, policy).await?
        } else {
            let started = Instant::now();
            match loader(pack.param.clone()).await {
                Ok(loaded) => {
                    let loaded: Loaded<V> = loaded.into();
                    let values = loaded.into_vec();
                    self.metrics.record_load(values.len(), started.elapsed());
                    debug!(key = %pack.cache_key, values = values.len(), "Loaded from source");
                    values
                }
                Err(e) => {
                    self.metrics.record_load_failure();
                    return Err(Error::Loader(e));
                }
            }
        };

        if data.is_empty() {
            if policy.cache_null {
                store
                    .put(&pack.cache_key, Vec::new(), policy.null_expire)
                    .await?;
            }
        } else {
            store
                .put(&pack.cache_key, data.clone(), policy.expire)
                .await?;
        }
        Ok(data)
    }

    // -------------------------------------------------------------------------
    // Batch
    // -------------------------------------------------------------------------

    fn resolve_many<'a, P, E, L, Fut>(
        &'a self,
        tier: usize,
        mut combination: ParamCombination<P>,
        ctx: &'a BatchContext<'a, E, L>,
    ) -> BoxFuture<'a, Result<Vec<V>>>
    where
        P: Eq + Hash + Clone + Send + Sync + 'a,
        E: Fn(&V) -> P + Sync,
        L: Fn(Vec<P>) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'a,
    {
        async move {
            let store = &self.tiers[tier];
            let mut result = Vec::new();
            let mut iterations: u32 = 0;

            while !combination.is_empty() {
                iterations += 1;

                let mut progressed = self.take_hits(tier, &mut combination, &mut result).await?;
                if combination.is_empty() {
                    break;
                }

                let lock_keys = combination.lock_keys();
                let locked = store
                    .put_all_if_absent(&lock_keys, Some(self.options.lock_ttl))
                    .await?;
                self.metrics
                    .record_locks(locked.len(), lock_keys.len().saturating_sub(locked.len()));

                if !locked.is_empty() {
                    let guard = LockGuard::new(Arc::clone(store), locked.clone());
                    let outcome = self
                        .load_many(tier, &mut combination, locked, ctx, &mut result)
                        .await;
                    guard.release().await;
                    progressed |= outcome?;
                }

                if combination.is_empty() {
                    break;
                }
                if !progressed {
                    self.backoff().await;
                }
                if iterations > self.options.warn_after_iterations {
                    if iterations == self.options.warn_after_iterations.saturating_add(1) {
                        self.metrics.record_slow_batch();
                    }
                    warn!(
                        tier,
                        iterations,
                        pending = combination.len(),
                        "Batch resolution still waiting on keys locked elsewhere"
                    );
                }
            }

            Ok(result)
        }
        .boxed()
    }

    /// Move every pending key that `tier` now holds into `result`
    async fn take_hits<P>(
        &self,
        tier: usize,
        combination: &mut ParamCombination<P>,
        result: &mut Vec<V>,
    ) -> Result<bool>
    where
        P: Eq + Hash + Clone + Send + Sync,
    {
        let cached = self.tiers[tier].get_all(&combination.cache_keys()).await?;
        let mut hits = 0;
        for (key, entry) in cached {
            if entry.is_success() && combination.remove_by_cache_key(&key).is_some() {
                result.extend(entry.into_data().unwrap_or_default());
                hits += 1;
            }
        }
        if hits > 0 {
            self.metrics.record_hits(tier, hits);
        }
        Ok(hits > 0)
    }

    /// Runs with `locked` held on `tier`
    async fn load_many<'a, P, E, L, Fut>(
        &'a self,
        tier: usize,
        combination: &mut ParamCombination<P>,
        locked: HashSet<String>,
        ctx: &'a BatchContext<'a, E, L>,
        result: &mut Vec<V>,
    ) -> Result<bool>
    where
        P: Eq + Hash + Clone + Send + Sync + 'a,
        E: Fn(&V) -> P + Sync,
        L: Fn(Vec<P>) -> Fut + Sync,
        Fut: Future<Output = anyhow::Result<Vec<V>>> + Send + 'a,
    {
        let progressed = self.take_hits(tier, combination, result).await?;

        let owned: HashSet<String> = locked
            .into_iter()
            .filter(|lock| combination.contains_lock_key(lock))
            .collect();
        if owned.is_empty() {
            return Ok(progressed);
        }
        let pending = ParamCombination::new(combination.packs_by_lock_keys(&owned));

        let loaded = if tier + 1 < self.tiers.len() {
            self.resolve_many(tier + 1, pending.clone(), ctx).await?
        } else {
            let started = Instant::now();
            match (ctx.loader)(pending.params()).await {
                Ok(values) => {
                    self.metrics.record_load(values.len(), started.elapsed());
                    debug!(keys = pending.len(), values = values.len(), "Batch loaded from source");
                    values
                }
                Err(e) => {
                    self.metrics.record_load_failure();
                    return Err(Error::Loader(e));
                }
            }
        };

        self.save_many(tier, &pending, &loaded, ctx).await?;

        for lock in &owned {
            combination.remove_by_lock_key(lock);
        }
        result.extend(loaded);
        Ok(true)
    }

    /// Write `loaded` back to `tier`, grouped under the locked packs they answer
    async fn save_many<P, E, L>(
        &self,
        tier: usize,
        locked: &ParamCombination<P>,
        loaded: &[V],
        ctx: &BatchContext<'_, E, L>,
    ) -> Result<()>
    where
        P: Eq + Hash + Clone + Sync,
        E: Fn(&V) -> P + Sync,
        L: Sync,
    {
        let store = &self.tiers[tier];

        let mut grouped: HashMap<String, Vec<V>> = HashMap::new();
        for value in loaded {
            match locked.cache_key_for_param(&(ctx.extractor)(value)) {
                Some(key) => grouped.entry(key.to_string()).or_default().push(value.clone()),
                None => debug!(tier, "Loaded value matches no locked parameter, not caching it"),
            }
        }

        if ctx.policy.cache_null {
            let empties: HashMap<String, Vec<V>> = locked
                .cache_keys()
                .into_iter()
                .filter(|key| !grouped.contains_key(key))
                .map(|key| (key, Vec::new()))
                .collect();
            if !empties.is_empty() {
                store.put_all(empties, ctx.policy.null_expire).await?;
            }
        }
        if !grouped.is_empty() {
            store.put_all(grouped, ctx.policy.expire).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::local::LocalStore;
    use crate::cache::store::Store;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn local() -> Arc<LocalStore<Vec<String>>> {
        Arc::new(LocalStore::new())
    }

    fn identity(p: &String) -> String {
        p.clone()
    }

    fn policy() -> CachePolicy {
        CachePolicy::new(Duration::from_secs(60))
    }

    #[test]
    fn test_loaded_normalization() {
        assert_eq!(Loaded::<u8>::from(None).into_vec(), Vec::<u8>::new());
        assert_eq!(Loaded::from(Some(1u8)).into_vec(), vec![1]);
        assert_eq!(Loaded::from(vec![1u8, 2]).into_vec(), vec![1, 2]);
    }

    #[test]
    fn test_empty_tier_list_gets_noop_tier() {
        let cache: TieredCache<String> = TieredCache::new(Vec::new());
        assert_eq!(cache.tier_count(), 1);
        assert_eq!(cache.tiers()[0].name(), "noop");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_load_once() {
        let cache = Arc::new(TieredCache::new(vec![local() as SharedStore<Vec<String>>]));
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_load(
                            "test".to_string(),
                            identity,
                            move |p: String| {
                                let calls = Arc::clone(&calls);
                                async move {
                                    calls.fetch_add(1, Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_millis(20)).await;
                                    Ok::<_, anyhow::Error>(Some(format!("{}cache", p)))
                                }
                            },
                            &policy(),
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            let values = handle.await.unwrap().unwrap();
            assert_eq!(values, vec!["testcache".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics().loads(), 1);
    }

    #[tokio::test]
    async fn test_miss_writes_back_to_every_tier() {
        let near = local();
        let far = local();
        let cache = TieredCache::new(vec![
            near.clone() as SharedStore<Vec<String>>,
            far.clone() as SharedStore<Vec<String>>,
        ]);

        let value = cache
            .get_or_load_one(
                "k".to_string(),
                identity,
                |p: String| async move { Ok::<_, anyhow::Error>(Some(p.to_uppercase())) },
                &policy(),
            )
            .await
            .unwrap();
        assert_eq!(value, Some("K".to_string()));

        assert_eq!(near.get("k").await.unwrap().into_data(), Some(vec!["K".to_string()]));
        assert_eq!(far.get("k").await.unwrap().into_data(), Some(vec!["K".to_string()]));

        // With the near tier emptied the far tier answers
        near.clear();
        let again = cache
            .get_or_load(
                "k".to_string(),
                identity,
                |_p: String| async move { Err::<Option<String>, _>(anyhow::anyhow!("must not load")) },
                &policy(),
            )
            .await
            .unwrap();
        assert_eq!(again, vec!["K".to_string()]);
        assert_eq!(cache.metrics().tier_hits(1), 1);
        assert!(near.get("k").await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let cache = TieredCache::new(vec![local() as SharedStore<Vec<String>>]);
        let calls = AtomicUsize::new(0);
        let policy = policy().with_null_caching(Duration::from_millis(150));

        let loader = |_p: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(None::<String>) }
        };

        for _ in 0..3 {
            let values = cache
                .get_or_load("ghost".to_string(), identity, &loader, &policy)
                .await
                .unwrap();
            assert!(values.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        cache
            .get_or_load("ghost".to_string(), identity, &loader, &policy)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_result_not_cached_without_null_caching() {
        let cache = TieredCache::new(vec![local() as SharedStore<Vec<String>>]);
        let calls = AtomicUsize::new(0);
        let loader = |_p: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(Vec::<String>::new()) }
        };

        for _ in 0..3 {
            cache
                .get_or_load("ghost".to_string(), identity, &loader, &policy())
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_releases_lock() {
        let store = local();
        let cache = TieredCache::new(vec![store.clone() as SharedStore<Vec<String>>]);

        let err = cache
            .get_or_load(
                "k".to_string(),
                identity,
                |_p: String| async move { Err::<Option<String>, _>(anyhow::anyhow!("db down")) },
                &policy(),
            )
            .await
            .unwrap_err();
        assert!(err.is_loader());
        assert_eq!(err.to_string(), "db down");
        assert_eq!(cache.metrics().snapshot().load_failures, 1);

        // A held lock would stall this call for the full lock TTL
        let value = tokio::time::timeout(
            Duration::from_secs(1),
            cache.get_or_load_one(
                "k".to_string(),
                identity,
                |p: String| async move { Ok::<_, anyhow::Error>(Some(p)) },
                &policy(),
            ),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(value, Some("k".to_string()));
    }

    #[tokio::test]
    async fn test_batch_partial_tier_hit() {
        let store = local();
        store
            .put("a", vec!["A".to_string()], None)
            .await
            .unwrap();
        let cache = TieredCache::new(vec![store.clone() as SharedStore<Vec<String>>]);
        let requests: Mutex<Vec<Vec<String>>> = Mutex::new(Vec::new());

        let mut values = cache
            .get_or_load_many(
                vec!["a".to_string(), "b".to_string()],
                identity,
                |v: &String| v.to_lowercase(),
                |params: Vec<String>| {
                    requests.lock().push(params.clone());
                    async move {
                        Ok::<_, anyhow::Error>(params.iter().map(|p| p.to_uppercase()).collect())
                    }
                },
                &policy(),
            )
            .await
            .unwrap();
        values.sort();

        assert_eq!(values, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(*requests.lock(), vec![vec!["b".to_string()]]);
        assert_eq!(store.get("b").await.unwrap().into_data(), Some(vec!["B".to_string()]));
        assert!(!store.get("$b$lock").await.unwrap().is_success());
        assert!(store.put_if_absent("$b$lock", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_falls_through_tiers() {
        let near = local();
        let far = local();
        far.put("a", vec!["A".to_string()], None).await.unwrap();
        let cache = TieredCache::new(vec![
            near.clone() as SharedStore<Vec<String>>,
            far.clone() as SharedStore<Vec<String>>,
        ]);
        let requests: Mutex<Vec<Vec<String>>> = Mutex::new(Vec::new());

        let values = cache
            .get_or_load_many(
                ["a".to_string(), "b".to_string()],
                identity,
                |v: &String| v.to_lowercase(),
                |params: Vec<String>| {
                    requests.lock().push(params.clone());
                    async move {
                        Ok::<_, anyhow::Error>(params.iter().map(|p| p.to_uppercase()).collect())
                    }
                },
                &policy(),
            )
            .await
            .unwrap();

        assert_eq!(values.len(), 2);
        assert_eq!(*requests.lock(), vec![vec!["b".to_string()]]);
        assert!(near.get("a").await.unwrap().is_success());
        assert!(near.get("b").await.unwrap().is_success());
        assert!(far.get("b").await.unwrap().is_success());
        assert_eq!(cache.metrics().tier_hits(1), 1);
    }

    #[tokio::test]
    async fn test_batch_negative_caching_and_stray_values() {
        let store = local();
        let cache = TieredCache::new(vec![store.clone() as SharedStore<Vec<String>>]);
        let policy = policy().with_null_caching(Duration::from_secs(60));

        // "b" loads nothing; the loader also returns an unrequested "Q"
        let mut values = cache
            .get_or_load_many(
                vec!["a".to_string(), "b".to_string()],
                identity,
                |v: &String| v.to_lowercase(),
                |_params: Vec<String>| async move {
                    Ok::<_, anyhow::Error>(vec!["A".to_string(), "Q".to_string()])
                },
                &policy,
            )
            .await
            .unwrap();
        values.sort();

        assert_eq!(values, vec!["A".to_string(), "Q".to_string()]);
        assert_eq!(store.get("b").await.unwrap().into_data(), Some(Vec::new()));
        assert!(!store.get("q").await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_batch_groups_results_by_extracted_param() {
        let store = local();
        let cache = TieredCache::new(vec![store.clone() as SharedStore<Vec<String>>]);
        let key_builds = AtomicUsize::new(0);

        let mut values = cache
            .get_or_load_many(
                vec![1u32, 2],
                |p: &u32| {
                    key_builds.fetch_add(1, Ordering::SeqCst);
                    format!("n:{}", p)
                },
                |v: &String| v.parse::<u32>().unwrap_or(0),
                |params: Vec<u32>| async move {
                    let mut values: Vec<String> = params.iter().map(|p| p.to_string()).collect();
                    values.push("9".to_string());
                    Ok::<_, anyhow::Error>(values)
                },
                &policy(),
            )
            .await
            .unwrap();
        values.sort();

        assert_eq!(values, vec!["1".to_string(), "2".to_string(), "9".to_string()]);
        // Keys are built once per parameter, never for loaded values
        assert_eq!(key_builds.load(Ordering::SeqCst), 2);
        assert_eq!(store.get("n:1").await.unwrap().into_data(), Some(vec!["1".to_string()]));
        assert_eq!(store.get("n:2").await.unwrap().into_data(), Some(vec!["2".to_string()]));
        assert!(!store.get("n:9").await.unwrap().is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_load_each_key_once() {
        let cache = Arc::new(TieredCache::new(vec![local() as SharedStore<Vec<String>>]));
        let loaded_keys = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let loaded_keys = Arc::clone(&loaded_keys);
                tokio::spawn(async move {
                    cache
                        .get_or_load_many(
                            vec!["x".to_string(), "y".to_string(), "z".to_string()],
                            identity,
                            |v: &String| v.to_lowercase(),
                            move |params: Vec<String>| {
                                let loaded_keys = Arc::clone(&loaded_keys);
                                async move {
                                    loaded_keys.fetch_add(params.len(), Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_millis(20)).await;
                                    Ok::<_, anyhow::Error>(
                                        params.iter().map(|p| p.to_uppercase()).collect(),
                                    )
                                }
                            },
                            &policy(),
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            let mut values = handle.await.unwrap().unwrap();
            values.sort();
            assert_eq!(values, vec!["X".to_string(), "Y".to_string(), "Z".to_string()]);
        }
        assert_eq!(loaded_keys.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_batch_loader_error_releases_locks() {
        let store = local();
        let cache = TieredCache::new(vec![store.clone() as SharedStore<Vec<String>>]);

        let err = cache
            .get_or_load_many(
                vec!["a".to_string(), "b".to_string()],
                identity,
                |v: &String| v.clone(),
                |_params: Vec<String>| async move {
                    Err::<Vec<String>, _>(anyhow::anyhow!("db down"))
                },
                &policy(),
            )
            .await
            .unwrap_err();
        assert!(err.is_loader());

        assert!(store.put_if_absent("$a$lock", None).await.unwrap());
        assert!(store.put_if_absent("$b$lock", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_batch_does_nothing() {
        let cache = TieredCache::new(vec![local() as SharedStore<Vec<String>>]);
        let calls = AtomicUsize::new(0);

        let values = cache
            .get_or_load_many(
                Vec::<String>::new(),
                identity,
                |v: &String| v.clone(),
                |_params: Vec<String>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, anyhow::Error>(Vec::new()) }
                },
                &policy(),
            )
            .await
            .unwrap();

        assert!(values.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_cache_clears_every_tier() {
        let near = local();
        let far = local();
        let cache = TieredCache::new(vec![
            near.clone() as SharedStore<Vec<String>>,
            far.clone() as SharedStore<Vec<String>>,
        ]);
        cache
            .get_or_load(
                "k".to_string(),
                identity,
                |p: String| async move { Ok::<_, anyhow::Error>(Some(p)) },
                &policy(),
            )
            .await
            .unwrap();

        cache
            .remove_cache(&HashSet::from(["k".to_string()]))
            .await
            .unwrap();

        assert!(!near.get("k").await.unwrap().is_success());
        assert!(!far.get("k").await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_no_tiers_always_loads() {
        let cache: TieredCache<String> = TieredCache::new(Vec::new());
        let calls = AtomicUsize::new(0);
        let loader = |p: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(Some(p)) }
        };

        for _ in 0..2 {
            let values = cache
                .get_or_load("k".to_string(), identity, &loader, &policy())
                .await
                .unwrap();
            assert_eq!(values, vec!["k".to_string()]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
