//! uaprobe - Fast client classification against compiled device datasets
//!
//! uaprobe resolves an identification string (typically an HTTP `User-Agent`)
//! to a set of typed attributes such as `isMobile`, `vendor` or `osVersion`,
//! using a precompiled reference dataset.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use uaprobe::CompiledTree;
//!
//! let tree = CompiledTree::from("devices.json").open()?;
//!
//! // Every attribute, typed
//! let props = tree.lookup("Mozilla/5.0 (Linux; Android 11.0)", None, true)?;
//! println!("mobile: {:?}", props.get("isMobile"));
//!
//! // One attribute, with attributes reported by the client itself
//! let tablet = tree.lookup_bool(
//!     "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)",
//!     "isTablet",
//!     Some("bisTablet:1|idisplayWidth:1080"),
//! )?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # How a lookup works
//!
//! ```text
//!  input ──► trie walk ──► UA regex rules ──► client overlay + client rules
//!              │                │                    │
//!        attribute ids    version numbers     second walk with a
//!        → value ids      and other captures  substitute string, overrides
//!              └────────────────┴────────────────────┴──► typed properties
//! ```
//!
//! For low-memory deployments [`CachedApi`] can load per-input shards of the
//! dataset (see [`optimizer`]) and memoize results in a [`CacheProvider`].
//! Long-running services that want to pick up new datasets without a restart
//! can use [`WatchingDataset`].

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Result cache backends
pub mod cache;
/// Lazily loading, result-caching facade
pub mod cached;
/// Compiled dataset and its loader
pub mod dataset;
/// Wire form of the dataset file
pub mod document;
/// Error types
pub mod error;
/// Lookup API and result type
pub mod lookup;
/// Dataset sharding
pub mod optimizer;
/// Client-supplied attribute overlays
pub mod overlay;
/// UA regex and client property rule engines
pub mod rules;
/// Structural checks of dataset files
pub mod validation;
/// Auto-reloading dataset wrapper
pub mod watching;

pub use crate::cache::{
    CacheProvider, FileCacheProvider, MemoryCacheProvider, DEFAULT_CACHE_CAPACITY,
    DEFAULT_ITEM_EXPIRY,
};
pub use crate::cached::{CachedApi, CachedApiBuilder, LookupStats, LookupStatsSnapshot};
pub use crate::dataset::{Attribute, CompiledTree, DatasetOpener, DatasetOptions};
pub use crate::document::{DatasetInfo, Document, MIN_SCHEMA_VERSION};
pub use crate::error::{CacheError, DatasetError, Result, UaprobeError};
pub use crate::lookup::Properties;
pub use crate::optimizer::{shard_id, TreeOptimizer, DEFAULT_SHARD_DIR_NAME, LOCK_EXPIRY};
pub use crate::overlay::ClientOverlay;
pub use crate::watching::{ReloadCallback, ReloadEvent, WatchingDataset, WatchingDatasetOpener};

pub use uaprobe_value::{AttributeId, TypeTag, Value, ValueId};

/// Library version
pub const UAPROBE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library major version
pub const UAPROBE_VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");

/// Library minor version
pub const UAPROBE_VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");

/// Library patch version
pub const UAPROBE_VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");
