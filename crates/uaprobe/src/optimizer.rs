//! Dataset sharding for low-memory deployments
//!
//! The full dataset is split by the first byte of the identification string.
//! A few very common prefixes get their own narrower sub-shard. Shards are
//! generated lazily on first use, stored next to each other in a cache
//! directory and regenerated when the source dataset is newer.
//!
//! ```text
//!   source.json ──► json.71            (inputs starting with 'G')
//!               ──► json.77            ('M', except the prefixes below)
//!               ──► json.77.iphone     ("Mozilla/5.0 (i...")
//!               ──► json.77.linux      ("Mozilla/5.0 (Linux...")
//! ```
//!
//! Generation is guarded by an on-disk lock per first byte. A process that
//! finds the lock held serves the full tree instead of waiting. Locks older
//! than [`LOCK_EXPIRY`] are considered abandoned and taken over.

use crate::dataset::CompiledTree;
use crate::document::Document;
use crate::error::DatasetError;
use crate::rules::compile_table;
use fs2::FileExt;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uaprobe_trie::{Node, Wanted};
use uaprobe_value::{IdTable, ValueId};

/// Age after which a generation lock is considered abandoned
pub const LOCK_EXPIRY: Duration = Duration::from_secs(10);

/// Directory name used under the system temp dir when none is configured
pub const DEFAULT_SHARD_DIR_NAME: &str = "uaprobe-shards";

/// Hand-maintained sub-shards: first byte → (label, prefix)
const SUB_SHARDS: &[(u8, &[(&str, &str)])] = &[(
    b'M',
    &[("iphone", "Mozilla/5.0 (i"), ("linux", "Mozilla/5.0 (Linux")],
)];

static SHARD_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^json\.\d+(\.[a-z]+)?(\.lock)?$").expect("valid regex"));

/// Default cache directory (`<tmp>/uaprobe-shards`)
pub fn default_shard_dir() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SHARD_DIR_NAME)
}

fn sub_shards(byte: u8) -> &'static [(&'static str, &'static str)] {
    for (b, subs) in SUB_SHARDS {
        if *b == byte {
            return subs;
        }
    }
    &[]
}

/// Shard key for an input: its first byte value, plus a sub-shard label
/// when one of the fixed prefixes matches
///
/// Returns `None` for empty input.
pub fn shard_id(input: &str) -> Option<String> {
    let byte = *input.as_bytes().first()?;
    let id = sub_shards(byte)
        .iter()
        .find(|(_, prefix)| input.starts_with(prefix))
        .map_or_else(|| byte.to_string(), |(label, _)| format!("{}.{}", byte, label));
    Some(id)
}

/// Generates and loads shards of one source dataset
#[derive(Debug, Clone)]
pub struct TreeOptimizer {
    source: PathBuf,
    dir: PathBuf,
    ua_rules: bool,
}

impl TreeOptimizer {
    /// Optimizer for `source`, caching shards under `dir`
    pub fn new(source: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dir: dir.into(),
            ua_rules: true,
        }
    }

    /// Keep or drop the UA regex rules in loaded trees
    pub fn ua_rules(mut self, enabled: bool) -> Self {
        self.ua_rules = enabled;
        self
    }

    /// Source dataset
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Shard cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding shard `id`
    pub fn shard_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("json.{}", id))
    }

    fn lock_path(&self, byte: u8) -> PathBuf {
        self.dir.join(format!("json.{}.lock", byte))
    }

    /// Load the tree that serves `input`
    ///
    /// Returns the shard if it is up to date, generating it first if needed.
    /// When another process holds the generation lock, or the input is empty,
    /// the full dataset is returned instead.
    pub fn load_shard(&self, input: &str) -> Result<CompiledTree, DatasetError> {
        let input = input.trim();
        let Some(id) = shard_id(input) else {
            return self.load_full();
        };
        let byte = input.as_bytes()[0];
        let path = self.shard_path(&id);

        if self.is_fresh(&path)? {
            return self.open_shard_or_full(&path, &id);
        }

        let Some(_lock) = ShardLock::acquire(&self.lock_path(byte))? else {
            debug!(shard = %id, "shard generation in progress elsewhere, using full tree");
            return self.load_full();
        };

        // may have been written while we waited for the lock
        if !self.is_fresh(&path)? {
            let doc = Document::from_path(&self.source)?;
            self.write_shards(&doc, byte)?;
        }
        self.open_shard_or_full(&path, &id)
    }

    /// Generate every shard of the source dataset and return the full tree
    ///
    /// Shards that are already newer than the source are skipped unless
    /// `force` is set. Bytes whose lock is held elsewhere are skipped.
    pub fn populate_cache(&self, force: bool) -> Result<CompiledTree, DatasetError> {
        let doc = Document::from_path(&self.source)?;
        let bytes: BTreeSet<u8> = doc
            .root
            .children()
            .keys()
            .filter_map(|edge| edge.as_bytes().first().copied())
            .collect();

        for byte in bytes {
            if !force && self.byte_is_fresh(byte)? {
                continue;
            }
            match ShardLock::acquire(&self.lock_path(byte))? {
                Some(_lock) => self.write_shards(&doc, byte)?,
                None => warn!(byte, "shard lock held elsewhere, not regenerating"),
            }
        }

        CompiledTree::from_document(doc, self.ua_rules)
    }

    /// Remove every shard and lock file from the cache directory
    ///
    /// Returns the number of files removed.
    pub fn clear_cache(&self) -> Result<usize, DatasetError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DatasetError::io(&self.dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| DatasetError::io(&self.dir, e))?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| SHARD_FILE.is_match(n)) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(DatasetError::io(entry.path(), e)),
            }
        }
        debug!(dir = %self.dir.display(), removed, "shard cache cleared");
        Ok(removed)
    }

    fn load_full(&self) -> Result<CompiledTree, DatasetError> {
        CompiledTree::from(&self.source).ua_rules(self.ua_rules).open()
    }

    fn open_shard_or_full(&self, path: &Path, id: &str) -> Result<CompiledTree, DatasetError> {
        let opened = Document::from_path(path)
            .and_then(|doc| CompiledTree::from_document(doc, self.ua_rules));
        match opened {
            Ok(tree) => Ok(tree.with_shard(id)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable shard, using full tree");
                self.load_full()
            }
        }
    }

    /// Shard newer than the source
    fn is_fresh(&self, shard: &Path) -> Result<bool, DatasetError> {
        let source = modified(&self.source).map_err(|e| DatasetError::io(&self.source, e))?;
        Ok(matches!(modified(shard), Ok(written) if written > source))
    }

    fn byte_is_fresh(&self, byte: u8) -> Result<bool, DatasetError> {
        if !self.is_fresh(&self.shard_path(&byte.to_string()))? {
            return Ok(false);
        }
        for (label, _) in sub_shards(byte) {
            if !self.is_fresh(&self.shard_path(&format!("{}.{}", byte, label)))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write the generic shard of `byte` and all of its sub-shards
    fn write_shards(&self, doc: &Document, byte: u8) -> Result<(), DatasetError> {
        fs::create_dir_all(&self.dir).map_err(|e| DatasetError::io(&self.dir, e))?;
        let synthetic = synthetic_nodes(doc)?;
        let subs = sub_shards(byte);

        let mut generic = Node::new();
        generic.values = doc.root.values.clone();
        generic.volatile = doc.root.volatile.clone();
        generic.rules = doc.root.rules.clone();
        for (edge, child) in doc.root.children() {
            if edge.as_bytes().first() == Some(&byte) {
                generic.insert_child(edge.clone(), child.clone());
            }
        }

        for (label, prefix) in subs {
            let mut root = extract_prefix(&mut generic, prefix);
            for (ua, node) in &synthetic {
                if !ua.starts_with(prefix) && root.child(ua).is_none() {
                    root.insert_child(ua.clone(), node.clone());
                }
            }
            self.write_shard(doc, root, &format!("{}.{}", byte, label))?;
        }

        for (ua, node) in &synthetic {
            let other_byte = ua.as_bytes().first() != Some(&byte);
            let routed_to_sub = subs.iter().any(|(_, prefix)| ua.starts_with(prefix));
            if (other_byte || routed_to_sub) && generic.child(ua).is_none() {
                generic.insert_child(ua.clone(), node.clone());
            }
        }
        self.write_shard(doc, generic, &byte.to_string())
    }

    fn write_shard(&self, doc: &Document, root: Node, id: &str) -> Result<(), DatasetError> {
        let mut shard = doc.shell();
        shard.root = root;
        let dropped = compact_values(&mut shard)?;
        let path = self.shard_path(id);
        shard.write_atomic(&path)?;
        info!(
            shard = id,
            nodes = shard.root.node_count(),
            values = shard.values.len(),
            dropped,
            "shard written"
        );
        Ok(())
    }
}

fn modified(path: &Path) -> io::Result<SystemTime> {
    fs::metadata(path)?.modified()
}

/// Full-tree walk result of every client rule substitute, keyed by the string
fn synthetic_nodes(doc: &Document) -> Result<Vec<(String, Node)>, DatasetError> {
    let Some(client_rules) = &doc.client_rules else {
        return Ok(Vec::new());
    };
    let normalizers = match doc.normalizer_patterns() {
        Some(table) => compile_table(table)?,
        None => IdTable::new(),
    };

    Ok(client_rules
        .substitutes()
        .into_iter()
        .map(|ua| {
            let walk = doc.root.walk(&normalizers, ua, Wanted::All);
            let mut node = Node::new();
            node.values = walk.found;
            (ua.to_string(), node)
        })
        .collect())
}

/// Move the branches reachable under `prefix` out of `node`
///
/// Edges that are a prefix of the remaining prefix are followed (copying the
/// node's own data along the way); edges that extend it are moved whole.
fn extract_prefix(node: &mut Node, prefix: &str) -> Node {
    let mut out = Node::new();
    out.values = node.values.clone();
    out.volatile = node.volatile.clone();
    out.rules = node.rules.clone();

    let edges: Vec<String> = node.children().keys().cloned().collect();
    for edge in edges {
        if edge.starts_with(prefix) {
            if let Some(child) = node.remove_child(&edge) {
                out.insert_child(edge, child);
            }
        } else if let Some(rest) = prefix.strip_prefix(edge.as_str()) {
            if let Some(child) = node.child_mut(&edge) {
                let branch = extract_prefix(child, rest);
                out.insert_child(edge, branch);
            }
        }
    }
    out
}

/// Drop unreferenced values and renumber the rest densely
///
/// Returns the number of values dropped. A reference to an id missing from
/// the value table is rejected.
fn compact_values(doc: &mut Document) -> Result<usize, DatasetError> {
    let mut used: BTreeSet<ValueId> = BTreeSet::new();
    doc.root.visit(&mut |_, node| {
        used.extend(node.values.values().copied());
        used.extend(node.volatile.values().copied());
    });
    if let Some(uar) = &doc.ua_rules {
        used.extend(uar.value_ids());
    }
    if let Some(cpr) = &doc.client_rules {
        used.extend(cpr.value_ids());
    }
    if let Some(dangling) = used.iter().find(|id| !doc.values.contains(**id)) {
        return Err(DatasetError::BadData(format!(
            "value id {} is referenced but not in the value table",
            dangling
        )));
    }

    let remap: FxHashMap<ValueId, ValueId> = used
        .iter()
        .enumerate()
        .map(|(new, old)| (*old, new as ValueId))
        .collect();
    let before = doc.values.len();
    doc.values = used
        .iter()
        .filter_map(|id| doc.values.get(*id).cloned())
        .collect();

    // every referenced id is in `remap`
    let map = |id: ValueId| remap.get(&id).copied().unwrap_or(id);
    doc.root.visit_mut(&mut |node| {
        for value in node.values.values_mut() {
            *value = map(*value);
        }
        for value in node.volatile.values_mut() {
            *value = map(*value);
        }
    });
    if let Some(uar) = doc.ua_rules.as_mut() {
        uar.remap_values(map);
    }
    if let Some(cpr) = doc.client_rules.as_mut() {
        cpr.remap_values(map);
    }

    Ok(before - doc.values.len())
}

/// Exclusive generation lock, released on drop
#[derive(Debug)]
struct ShardLock {
    file: File,
    path: PathBuf,
}

impl ShardLock {
    /// Take the lock, or `None` if another generator holds it
    fn acquire(path: &Path) -> Result<Option<Self>, DatasetError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| DatasetError::io(dir, e))?;
        }

        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let age = modified(path)
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .unwrap_or_default();
                if age < LOCK_EXPIRY {
                    return Ok(None);
                }
                warn!(path = %path.display(), age_ms = age.as_millis() as u64, "taking over abandoned shard lock");
                OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| DatasetError::io(path, e))?
            }
            Err(e) => return Err(DatasetError::io(path, e)),
        };

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Ok(None);
        }

        let mut lock = ShardLock {
            file,
            path: path.to_path_buf(),
        };
        // refresh the mtime so the lock is not seen as abandoned
        lock.file.set_len(0).map_err(|e| DatasetError::io(path, e))?;
        writeln!(lock.file, "{}", std::process::id()).map_err(|e| DatasetError::io(path, e))?;
        Ok(Some(lock))
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        // unlink while still holding the lock
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
    }
}
