//! Error types for uaprobe
//!
//! Loading problems are reported as [`DatasetError`], cache backend problems
//! as [`CacheError`]. Both are wrapped by [`UaprobeError`], which adds the
//! per-lookup failures.

use std::path::PathBuf;
use thiserror::Error;
use uaprobe_value::TypeTag;

/// Errors raised while loading, sharding or validating a dataset
#[derive(Error, Debug)]
pub enum DatasetError {
    /// File could not be read or written
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid JSON or does not have the expected shape
    #[error("malformed dataset: {0}")]
    Json(#[from] serde_json::Error),

    /// Document parsed but its content is inconsistent
    #[error("bad data in dataset: {0}")]
    BadData(String),

    /// Schema version older than the minimum supported
    #[error("dataset schema version {found} is not supported (minimum {minimum})")]
    UnsupportedVersion {
        /// Version declared by the document
        found: f64,
        /// Minimum supported version
        minimum: f64,
    },

    /// A regex in the dataset does not compile
    #[error("invalid regex #{id} {pattern:?}: {source}")]
    InvalidRegex {
        /// Regex id within its table
        id: u32,
        /// Pattern as written in the dataset
        pattern: String,
        /// Compilation error
        #[source]
        source: regex::Error,
    },

    /// File watcher could not be set up
    #[error("cannot watch {}: {source}", path.display())]
    Watch {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: notify::Error,
    },

    /// A client overlay was given but the dataset has no client rules
    #[error("dataset does not support client properties")]
    NoClientRules,
}

impl DatasetError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DatasetError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by cache backends
#[derive(Error, Debug)]
pub enum CacheError {
    /// Backend storage failed
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded
    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Another thread panicked while holding the cache
    #[error("cache lock poisoned")]
    Poisoned,
}

/// Main error type for uaprobe operations
#[derive(Error, Debug)]
pub enum UaprobeError {
    /// Dataset could not be loaded
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Cache backend failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Attribute name not present in the dataset
    #[error("the attribute {0:?} is not known in this dataset")]
    UnknownAttribute(String),

    /// Attribute is known but has no value for this input
    #[error("the attribute {name:?} does not exist for the input {input:?}")]
    InvalidAttribute {
        /// Requested attribute
        name: String,
        /// Identification string that was looked up
        input: String,
    },

    /// Typed accessor used on an attribute of a different type
    #[error("{name} is not of type {expected}")]
    IncorrectType {
        /// Requested attribute
        name: String,
        /// Type the accessor expects
        expected: TypeTag,
    },

    /// Client overlay string could not be decoded
    #[error("could not decode client properties: {0}")]
    ClientOverlay(String),
}

/// Result type alias for uaprobe operations
pub type Result<T> = std::result::Result<T, UaprobeError>;
