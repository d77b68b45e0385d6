use super::CacheProvider;
use crate::error::CacheError;
use crate::lookup::Properties;
use lru::LruCache;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default number of entries kept by [`MemoryCacheProvider`]
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

type Entries = LruCache<String, (Properties, Option<Instant>), BuildHasherDefault<FxHasher>>;

/// In-process LRU cache, shared by all threads
pub struct MemoryCacheProvider {
    entries: Mutex<Entries>,
    default_ttl: Option<Duration>,
}

impl MemoryCacheProvider {
    /// Cache holding up to `capacity` entries (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::with_hasher(capacity, BuildHasherDefault::default())),
            default_ttl: None,
        }
    }

    /// Expire entries stored without an explicit ttl after `ttl`
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |entries| entries.len())
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, CacheError> {
        self.entries.lock().map_err(|_| CacheError::Poisoned)
    }
}

impl Default for MemoryCacheProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn get(&self, key: &str) -> Result<Option<Properties>, CacheError> {
        let mut entries = self.lock()?;
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((props, expires)) => match expires {
                Some(at) if Instant::now() >= *at => true,
                _ => return Ok(Some(props.clone())),
            },
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    fn set(&self, key: &str, value: &Properties, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires = ttl.or(self.default_ttl).map(|ttl| Instant::now() + ttl);
        self.lock()?.put(key.to_string(), (value.clone(), expires));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.pop(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }
}
