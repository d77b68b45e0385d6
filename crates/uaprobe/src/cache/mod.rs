//! Result cache backends
//!
//! [`CachedApi`](crate::CachedApi) memoizes final attribute sets through a
//! [`CacheProvider`]. Two backends ship with the crate; networked stores can
//! be plugged in by implementing the trait.

use crate::error::CacheError;
use crate::lookup::Properties;
use std::time::Duration;

mod file;
mod memory;

pub use file::{FileCacheProvider, DEFAULT_ITEM_EXPIRY};
pub use memory::{MemoryCacheProvider, DEFAULT_CACHE_CAPACITY};

/// Minimal key-value contract of a result cache
///
/// A missing key is `Ok(None)`, never an error. Callers treat every error as
/// a cache miss.
pub trait CacheProvider: Send + Sync {
    /// Cached value for `key`
    fn get(&self, key: &str) -> Result<Option<Properties>, CacheError>;

    /// Store `value`; `ttl` of `None` uses the backend's default expiry
    fn set(&self, key: &str, value: &Properties, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove `key` if present
    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove everything
    fn clear(&self) -> Result<(), CacheError>;
}
