//! Batch working set
//!
//! A `ParamPack` ties one caller parameter to the cache key and lock key
//! derived from it. A `ParamCombination` is the set of packs a batch
//! resolution still has to resolve, indexed three ways. Packs leave all
//! three indices together.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use super::lock::lock_key;

/// One parameter with its derived keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamPack<P> {
    pub param: P,
    pub cache_key: String,
    pub lock_key: String,
}

impl<P> ParamPack<P> {
    pub fn new<K>(param: P, key_builder: K) -> Self
    where
        K: FnOnce(&P) -> String,
    {
        let cache_key = key_builder(&param);
        let lock_key = lock_key(&cache_key);
        Self {
            param,
            cache_key,
            lock_key,
        }
    }
}

/// Unresolved packs of a batch resolution.
///
/// Packs sharing a cache key collapse into the first one seen.
#[derive(Debug, Clone)]
pub struct ParamCombination<P> {
    by_cache_key: HashMap<String, ParamPack<P>>,
    by_lock_key: HashMap<String, String>,
    by_param: HashMap<P, String>,
}

impl<P> ParamCombination<P>
where
    P: Eq + Hash + Clone,
{
    pub fn new(packs: impl IntoIterator<Item = ParamPack<P>>) -> Self {
        let mut combination = Self {
            by_cache_key: HashMap::new(),
            by_lock_key: HashMap::new(),
            by_param: HashMap::new(),
        };
        for pack in packs {
            if combination.by_cache_key.contains_key(&pack.cache_key) {
                continue;
            }
            combination
                .by_lock_key
                .insert(pack.lock_key.clone(), pack.cache_key.clone());
            combination
                .by_param
                .insert(pack.param.clone(), pack.cache_key.clone());
            combination.by_cache_key.insert(pack.cache_key.clone(), pack);
        }
        combination
    }

    pub fn len(&self) -> usize {
        self.by_cache_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cache_key.is_empty()
    }

    pub fn cache_keys(&self) -> HashSet<String> {
        self.by_cache_key.keys().cloned().collect()
    }

    pub fn lock_keys(&self) -> HashSet<String> {
        self.by_lock_key.keys().cloned().collect()
    }

    pub fn contains_lock_key(&self, lock_key: &str) -> bool {
        self.by_lock_key.contains_key(lock_key)
    }

    /// Cache key a loaded value belongs to, given the parameter extracted from it
    pub fn cache_key_for_param(&self, param: &P) -> Option<&str> {
        self.by_param.get(param).map(String::as_str)
    }

    /// Raw parameters, one per pack
    pub fn params(&self) -> Vec<P> {
        self.by_cache_key
            .values()
            .map(|pack| pack.param.clone())
            .collect()
    }

    /// Clones of the packs behind `lock_keys`; unknown keys are skipped
    pub fn packs_by_lock_keys(&self, lock_keys: &HashSet<String>) -> Vec<ParamPack<P>> {
        lock_keys
            .iter()
            .filter_map(|lock| self.by_lock_key.get(lock))
            .filter_map(|cache_key| self.by_cache_key.get(cache_key))
            .cloned()
            .collect()
    }

    pub fn remove_by_cache_key(&mut self, cache_key: &str) -> Option<ParamPack<P>> {
        let pack = self.by_cache_key.remove(cache_key)?;
        self.by_lock_key.remove(&pack.lock_key);
        self.by_param.remove(&pack.param);
        Some(pack)
    }

    pub fn remove_by_lock_key(&mut self, lock_key: &str) -> Option<ParamPack<P>> {
        let cache_key = self.by_lock_key.get(lock_key)?.clone();
        self.remove_by_cache_key(&cache_key)
    }
}
