//! Cached lookup facade
//!
//! [`CachedApi`] loads the dataset lazily (whole or as a shard), memoizes
//! final attribute sets in a [`CacheProvider`] and keeps the tree it loaded
//! for later lookups.
//!
//! Once a tree is in memory and serves the input, lookups are computed
//! directly. The result cache is consulted only when answering would
//! otherwise require a load, so a fresh process sharing a persistent cache
//! can answer repeated inputs without touching the dataset at all.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use uaprobe::{CachedApi, FileCacheProvider};
//!
//! let api = CachedApi::builder("devices.json")
//!     .cache_provider(Arc::new(FileCacheProvider::new("/var/cache/uaprobe", Duration::from_secs(3600))))
//!     .sharding(true)
//!     .build();
//!
//! let props = api.lookup("Mozilla/5.0 (Linux; Android 14)", None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::cache::{CacheProvider, MemoryCacheProvider};
use crate::dataset::CompiledTree;
use crate::error::{DatasetError, Result, UaprobeError};
use crate::lookup::Properties;
use crate::optimizer::{default_shard_dir, shard_id, TreeOptimizer};
use arc_swap::ArcSwapOption;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use uaprobe_value::{TypeTag, Value};

/// Counters for lookups served by a [`CachedApi`]
#[derive(Debug, Default)]
pub struct LookupStats {
    /// Lookups with a non-empty input
    pub lookups: AtomicU64,
    /// Lookups computed against a tree already in memory
    pub direct: AtomicU64,
    /// Lookups answered by the result cache
    pub cache_hits: AtomicU64,
    /// Result cache misses (including backend errors)
    pub cache_misses: AtomicU64,
    /// Dataset or shard loads
    pub loads: AtomicU64,
}

/// Point-in-time copy of [`LookupStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LookupStatsSnapshot {
    /// Lookups with a non-empty input
    pub lookups: u64,
    /// Lookups computed against a tree already in memory
    pub direct: u64,
    /// Lookups answered by the result cache
    pub cache_hits: u64,
    /// Result cache misses
    pub cache_misses: u64,
    /// Dataset or shard loads
    pub loads: u64,
}

impl LookupStats {
    /// Take a snapshot of the counters
    pub fn snapshot(&self) -> LookupStatsSnapshot {
        LookupStatsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }
}

impl LookupStatsSnapshot {
    /// Share of cache consultations that hit (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Builder for [`CachedApi`]
pub struct CachedApiBuilder {
    source: PathBuf,
    cache: Option<Arc<dyn CacheProvider>>,
    cache_ttl: Option<Duration>,
    sharding: bool,
    shard_dir: Option<PathBuf>,
    ua_rules: bool,
}

impl CachedApiBuilder {
    /// Result cache backend (default: an in-memory LRU)
    pub fn cache_provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(provider);
        self
    }

    /// Do not memoize results
    pub fn no_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    /// Expiry passed to the cache backend on every write
    ///
    /// Default: the backend's own default.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Load per-input shards instead of the full dataset
    pub fn sharding(mut self, enabled: bool) -> Self {
        self.sharding = enabled;
        self
    }

    /// Shard cache directory (default: `<tmp>/uaprobe-shards`)
    pub fn shard_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shard_dir = Some(dir.into());
        self
    }

    /// Keep or drop the UA regex rules
    pub fn ua_rules(mut self, enabled: bool) -> Self {
        self.ua_rules = enabled;
        self
    }

    /// Create the facade; nothing is loaded until the first lookup
    pub fn build(self) -> CachedApi {
        let dir = self.shard_dir.unwrap_or_else(default_shard_dir);
        CachedApi {
            optimizer: TreeOptimizer::new(&self.source, dir).ua_rules(self.ua_rules),
            source: self.source,
            ua_rules: self.ua_rules,
            sharding: AtomicBool::new(self.sharding),
            tree: ArcSwapOption::empty(),
            load_lock: Mutex::new(()),
            cache: self.cache,
            cache_ttl: self.cache_ttl,
            stats: LookupStats::default(),
        }
    }
}

/// Lazily loading, result-caching lookup facade
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct CachedApi {
    source: PathBuf,
    optimizer: TreeOptimizer,
    ua_rules: bool,
    sharding: AtomicBool,
    tree: ArcSwapOption<CompiledTree>,
    load_lock: Mutex<()>,
    cache: Option<Arc<dyn CacheProvider>>,
    cache_ttl: Option<Duration>,
    stats: LookupStats,
}

impl CachedApi {
    /// Start configuring a facade over the dataset at `path`
    pub fn builder(path: impl Into<PathBuf>) -> CachedApiBuilder {
        CachedApiBuilder {
            source: path.into(),
            cache: Some(Arc::new(MemoryCacheProvider::default())),
            cache_ttl: None,
            sharding: false,
            shard_dir: None,
            ua_rules: true,
        }
    }

    /// Typed attributes for `input`
    ///
    /// An empty (or all-whitespace) input yields an empty set.
    pub fn lookup(&self, input: &str, overlay: Option<&str>) -> Result<Properties> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Properties::default());
        }
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(tree) = self.tree_serving(input) {
            self.stats.direct.fetch_add(1, Ordering::Relaxed);
            return tree.lookup(input, overlay, true);
        }

        let key = cache_key(input, overlay);
        if let Some(props) = self.cached(&key) {
            return Ok(props);
        }

        let tree = self.load_tree(input)?;
        let props = tree.lookup(input, overlay, true)?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&key, &props, self.cache_ttl) {
                warn!(error = %e, "failed to store lookup result");
            }
        }
        Ok(props)
    }

    /// One typed attribute for `input`
    pub fn lookup_single(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<Value> {
        let props = self.lookup(input, overlay)?;
        if let Some(value) = props.get(name) {
            return Ok(value.clone());
        }

        let tree = match self.tree_serving(input.trim()) {
            Some(tree) => tree,
            None => self.load_tree(input.trim())?,
        };
        if tree.attribute_id(name).is_some() {
            Err(UaprobeError::InvalidAttribute {
                name: name.to_string(),
                input: input.trim().to_string(),
            })
        } else {
            Err(UaprobeError::UnknownAttribute(name.to_string()))
        }
    }

    /// Every attribute of the dataset with its type
    pub fn list_attributes(&self) -> Result<BTreeMap<String, TypeTag>> {
        Ok(self.any_tree()?.list_attributes())
    }

    /// Dataset revision
    pub fn revision(&self) -> Result<u64> {
        Ok(self.any_tree()?.revision())
    }

    /// Dataset generation time as a unix timestamp
    pub fn generated_at(&self) -> Result<i64> {
        Ok(self.any_tree()?.generated_at())
    }

    /// Whether lookups are still served from shards
    pub fn is_sharding(&self) -> bool {
        self.sharding.load(Ordering::Acquire)
    }

    /// The tree currently in memory, if any
    pub fn snapshot(&self) -> Option<Arc<CompiledTree>> {
        self.tree.load_full()
    }

    /// Lookup counters
    pub fn stats(&self) -> LookupStatsSnapshot {
        self.stats.snapshot()
    }

    /// Generate every shard ahead of time
    ///
    /// The full tree parsed for the run stays loaded and sharding is turned
    /// off for this instance.
    pub fn populate_shard_cache(&self, force: bool) -> Result<()> {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let tree = self.optimizer.populate_cache(force)?;
        info!(revision = tree.revision(), dir = %self.optimizer.dir().display(), "shard cache populated");

        self.sharding.store(false, Ordering::Release);
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        self.tree.store(Some(Arc::new(tree)));
        Ok(())
    }

    /// Remove generated shards; returns the number of files removed
    pub fn clear_shard_cache(&self) -> Result<usize> {
        Ok(self.optimizer.clear_cache()?)
    }

    /// Empty the result cache
    pub fn clear_result_cache(&self) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.clear()?;
        }
        Ok(())
    }

    /// Loaded tree, if it can answer for `input`
    fn tree_serving(&self, input: &str) -> Option<Arc<CompiledTree>> {
        let tree = self.tree.load_full()?;
        let serves = !self.is_sharding()
            || tree.shard().is_none()
            || tree.shard() == shard_id(input).as_deref();
        serves.then_some(tree)
    }

    fn cached(&self, key: &str) -> Option<Properties> {
        let cache = self.cache.as_ref()?;
        match cache.get(key) {
            Ok(Some(props)) => {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(props)
            }
            Ok(None) => {
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(error = %e, "result cache unavailable, computing directly");
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn any_tree(&self) -> std::result::Result<Arc<CompiledTree>, DatasetError> {
        match self.tree.load_full() {
            Some(tree) => Ok(tree),
            None => self.load_tree(""),
        }
    }

    fn load_tree(&self, input: &str) -> std::result::Result<Arc<CompiledTree>, DatasetError> {
        let _guard = self.load_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tree) = self.tree_serving(input) {
            return Ok(tree);
        }

        let tree = if !self.is_sharding() {
            self.load_full()?
        } else if self.tree.load().is_some() {
            info!("input belongs to another shard, switching to the full dataset");
            self.sharding.store(false, Ordering::Release);
            self.load_full()?
        } else {
            self.optimizer.load_shard(input)?
        };
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        debug!(shard = tree.shard().unwrap_or("full"), "tree loaded");

        let tree = Arc::new(tree);
        self.tree.store(Some(Arc::clone(&tree)));
        Ok(tree)
    }

    fn load_full(&self) -> std::result::Result<CompiledTree, DatasetError> {
        CompiledTree::from(&self.source).ua_rules(self.ua_rules).open()
    }
}

/// Result cache key: the input, plus a digest of the overlay when present
pub fn cache_key(input: &str, overlay: Option<&str>) -> String {
    match overlay.filter(|s| !s.is_empty()) {
        Some(overlay) => format!("{}::{}", input, hex::encode(Sha256::digest(overlay.as_bytes()))),
        None => input.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("ua", None), "ua");
        assert_eq!(cache_key("ua", Some("")), "ua");
        let key = cache_key("ua", Some("bisTablet:1"));
        assert!(key.starts_with("ua::"));
        assert_eq!(key.len(), 4 + 64);
        assert_ne!(key, cache_key("ua", Some("bisTablet:0")));
    }

    #[test]
    fn test_hit_rate() {
        let snapshot = LookupStatsSnapshot {
            cache_hits: 3,
            cache_misses: 1,
            ..Default::default()
        };
        assert_eq!(snapshot.cache_hit_rate(), 0.75);
        assert_eq!(LookupStatsSnapshot::default().cache_hit_rate(), 0.0);
    }
}
