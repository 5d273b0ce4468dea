//! Cachelink Integration Tests
//!
//! End-to-end behaviour of the public API:
//! - Local store expiry and sweeping
//! - Stampede prevention, single and batch
//! - Partial tier hits and negative caching
//! - Failover around a broken tier
//! - Redis chunked reads (needs `REDIS_URL`, run with `--ignored`)

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;

use cachelink::cache::{
    CachePolicy, CacheResult, Expiry, FailoverStore, LocalConfig, LocalStore, SharedStore, Store,
    TieredCache,
};
use cachelink::{CacheConfiguration, Error, Result};

fn keys(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Local store
// =============================================================================

mod local_store_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get_then_expire() {
        let store: LocalStore<String> = LocalStore::new();

        store
            .put("k", "v".to_string(), Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().into_data(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!store.get("k").await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_sweeper_reclaims_locks_without_reads() {
        let store: LocalStore<String> = LocalStore::with_config(LocalConfig {
            sweep_interval: Duration::from_millis(20),
            ..LocalConfig::default()
        });
        store.start();

        assert!(store
            .put_if_absent("$k$lock", Some(Duration::from_millis(30)))
            .await
            .unwrap());
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.len(), 0);
        assert!(store.stats().expirations >= 1);

        store.stop().await;
        assert!(!store.is_running());
    }

    #[tokio::test]
    async fn test_batch_ops_match_single_ops() {
        let store: LocalStore<u32> = LocalStore::new();
        let values: HashMap<String, u32> = (0..20).map(|i| (format!("k{}", i), i)).collect();
        store.put_all(values.clone(), None).await.unwrap();

        let wanted: HashSet<String> = values.keys().cloned().chain(["missing".to_string()]).collect();
        let all = store.get_all(&wanted).await.unwrap();
        assert_eq!(all.len(), 21);
        for (key, value) in &values {
            assert_eq!(all[key].data, Some(*value));
            assert_eq!(store.get(key).await.unwrap().data, Some(*value));
        }
        assert!(!all["missing"].is_success());

        store.remove_all(&keys(&["k1", "k2"])).await.unwrap();
        assert!(!store.get("k1").await.unwrap().is_success());
        assert!(store.get("k3").await.unwrap().is_success());
    }
}

// =============================================================================
// Resolver
// =============================================================================

mod resolver_tests {
    use super::*;

    fn local_tier() -> Arc<LocalStore<Vec<String>>> {
        Arc::new(LocalStore::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fifty_callers_one_load() {
        let cache = Arc::new(TieredCache::new(vec![local_tier() as SharedStore<Vec<String>>]));
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = CachePolicy::new(Duration::from_secs(60));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    cache
                        .get_or_load_one(
                            "test".to_string(),
                            |p: &String| p.clone(),
                            move |p: String| {
                                let calls = Arc::clone(&calls);
                                async move {
                                    calls.fetch_add(1, Ordering::SeqCst);
                                    tokio::time::sleep(Duration::from_millis(30)).await;
                                    Ok::<_, anyhow::Error>(Some(p + "cache"))
                                }
                            },
                            &policy,
                        )
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), Some("testcache".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_tier_hit_loads_only_missing() {
        let tier = local_tier();
        tier.put("a", vec!["A".to_string()], None).await.unwrap();
        let cache = TieredCache::new(vec![tier as SharedStore<Vec<String>>]);
        let seen = parking_lot::Mutex::new(Vec::new());

        let mut values = cache
            .get_or_load_many(
                ["a".to_string(), "b".to_string()],
                |p: &String| p.clone(),
                |v: &String| v.to_lowercase(),
                |params: Vec<String>| {
                    seen.lock().push(params.clone());
                    async move {
                        Ok::<_, anyhow::Error>(params.into_iter().map(|p| p.to_uppercase()).collect())
                    }
                },
                &CachePolicy::new(Duration::from_secs(60)),
            )
            .await
            .unwrap();
        values.sort();

        assert_eq!(values, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(*seen.lock(), vec![vec!["b".to_string()]]);
    }

    #[tokio::test]
    async fn test_negative_caching_until_null_expiry() {
        let cache = TieredCache::new(vec![local_tier() as SharedStore<Vec<String>>]);
        let calls = AtomicUsize::new(0);
        let policy = CachePolicy::new(Duration::from_secs(60))
            .with_null_caching(Duration::from_millis(100));
        let loader = |_p: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(None::<String>) }
        };

        for _ in 0..5 {
            let value = cache
                .get_or_load_one("nobody".to_string(), |p: &String| p.clone(), &loader, &policy)
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cache
            .get_or_load_one("nobody".to_string(), |p: &String| p.clone(), &loader, &policy)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_error_reaches_caller_unwrapped() {
        #[derive(Debug, thiserror::Error)]
        #[error("row not found")]
        struct RowMissing;

        let cache = TieredCache::new(vec![local_tier() as SharedStore<Vec<String>>]);
        let err = cache
            .get_or_load(
                "k".to_string(),
                |p: &String| p.clone(),
                |_p: String| async { Err::<Option<String>, _>(anyhow::Error::new(RowMissing)) },
                &CachePolicy::default(),
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::Loader(inner) if inner.downcast_ref::<RowMissing>().is_some());
    }

    #[tokio::test]
    async fn test_configured_chain_resolves() {
        let tiers = CacheConfiguration::local_only()
            .build_tiers::<String>()
            .await
            .unwrap();
        let cache = tiers.cache();
        let policy = CachePolicy::default();

        for _ in 0..3 {
            let values = cache
                .get_or_load_many(
                    vec![1u32, 2, 3],
                    |p: &u32| format!("n:{}", p),
                    |v: &String| v.parse::<u32>().unwrap_or(0),
                    |params: Vec<u32>| async move {
                        Ok::<_, anyhow::Error>(params.iter().map(|p| p.to_string()).collect())
                    },
                    &policy,
                )
                .await
                .unwrap();
            assert_eq!(values.len(), 3);
        }
        let snapshot = cache.metrics().snapshot();
        assert_eq!(snapshot.loads, 1);
        assert_eq!(snapshot.tier_hits, vec![6]);

        tiers.shutdown().await;
        assert!(!tiers.local().is_running());
    }
}

// =============================================================================
// Failover
// =============================================================================

mod failover_tests {
    use super::*;

    struct DownStore;

    fn down<T>() -> Result<T> {
        Err(Error::Internal("connection reset".to_string()))
    }

    #[async_trait]
    impl Store<Vec<String>> for DownStore {
        async fn get(&self, _key: &str) -> Result<CacheResult<Vec<String>>> {
            down()
        }
        async fn get_all(&self, _keys: &HashSet<String>) -> Result<HashMap<String, CacheResult<Vec<String>>>> {
            down()
        }
        async fn put(&self, _key: &str, _value: Vec<String>, _ttl: Expiry) -> Result<()> {
            down()
        }
        async fn put_all(&self, _values: HashMap<String, Vec<String>>, _ttl: Expiry) -> Result<()> {
            down()
        }
        async fn put_if_absent(&self, _key: &str, _ttl: Expiry) -> Result<bool> {
            down()
        }
        async fn put_all_if_absent(&self, _keys: &HashSet<String>, _ttl: Expiry) -> Result<HashSet<String>> {
            down()
        }
        async fn remove(&self, _key: &str) -> Result<bool> {
            down()
        }
        async fn remove_all(&self, _keys: &HashSet<String>) -> Result<()> {
            down()
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_broken_tier_degrades_to_loading() {
        let broken: SharedStore<Vec<String>> = Arc::new(FailoverStore::<Vec<String>>::new(Arc::new(DownStore)));
        let cache = TieredCache::new(vec![broken]);
        let calls = AtomicUsize::new(0);
        let loader = |p: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, anyhow::Error>(Some(p)) }
        };

        for _ in 0..3 {
            let value = cache
                .get_or_load_one("k".to_string(), |p: &String| p.clone(), &loader, &CachePolicy::default())
                .await
                .unwrap();
            assert_eq!(value, Some("k".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.remove_cache(&keys(&["k"])).await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_front_tier_falls_through_to_healthy_tier() {
        let healthy = Arc::new(LocalStore::<Vec<String>>::new());
        healthy.put("k", vec!["cached".to_string()], None).await.unwrap();

        let cache = TieredCache::new(vec![
            Arc::new(FailoverStore::<Vec<String>>::new(Arc::new(DownStore))) as SharedStore<Vec<String>>,
            healthy as SharedStore<Vec<String>>,
        ]);
        let value = cache
            .get_or_load_one(
                "k".to_string(),
                |p: &String| p.clone(),
                |_p: String| async { Err::<Option<String>, _>(anyhow::anyhow!("must not load")) },
                &CachePolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(value, Some("cached".to_string()));
    }
}

// =============================================================================
// Redis (live server)
// =============================================================================

mod redis_tests {
    use super::*;
    use cachelink::cache::{RedisConfig, RedisStore};

    async fn connect() -> RedisStore<Vec<String>> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisStore::connect(&RedisConfig {
            url,
            ..RedisConfig::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_tier_behind_local_tier() {
        let prefix = format!("it:{}:", uuid::Uuid::new_v4());
        let remote = Arc::new(connect().await);
        let local = Arc::new(LocalStore::<Vec<String>>::new());
        let cache = TieredCache::new(vec![
            local.clone() as SharedStore<Vec<String>>,
            remote.clone() as SharedStore<Vec<String>>,
        ]);
        let policy = CachePolicy::new(Duration::from_secs(30));

        let key_for = |p: &String| format!("{}{}", prefix, p);
        let value = cache
            .get_or_load_one(
                "x".to_string(),
                key_for,
                |p: String| async move { Ok::<_, anyhow::Error>(Some(p)) },
                &policy,
            )
            .await
            .unwrap();
        assert_eq!(value, Some("x".to_string()));

        let key = format!("{}x", prefix);
        assert!(remote.get(&key).await.unwrap().is_success());
        assert!(local.get(&key).await.unwrap().is_success());

        cache.remove_cache(&HashSet::from([key.clone()])).await.unwrap();
        assert!(!remote.get(&key).await.unwrap().is_success());
    }
}
