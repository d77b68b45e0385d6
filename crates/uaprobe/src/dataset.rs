//! Compiled, immutable dataset
//!
//! A [`CompiledTree`] is built once per load and then shared by every
//! concurrent lookup. Use [`CompiledTree::from`] to configure and open one
//! from a file, or [`CompiledTree::from_slice`] for in-memory JSON.
//!
//! ```no_run
//! use uaprobe::CompiledTree;
//!
//! let tree = CompiledTree::from("devices.json").open()?;
//! let props = tree.lookup("Mozilla/5.0 (Linux; Android 14)", None, true)?;
//! println!("{:?}", props.get("isMobile"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::document::{DatasetInfo, Document};
use crate::error::DatasetError;
use crate::rules::{compile_table, ClientRules, UaRules};
use regex::Regex;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use uaprobe_trie::Node;
use uaprobe_value::{AttributeId, IdTable, TypeTag, Value, ValueId};

/// A dataset attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Name without the type prefix
    pub name: String,
    /// Declared type
    pub tag: TypeTag,
}

/// Options for opening a dataset
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Path to the dataset file
    pub path: PathBuf,

    /// Keep the UA regex rules (attributes that change with the
    /// identification string, such as version numbers)
    pub ua_rules: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            ua_rules: true,
        }
    }
}

/// Builder for opening a dataset, created by [`CompiledTree::from`]
pub struct DatasetOpener {
    options: DatasetOptions,
}

impl DatasetOpener {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            options: DatasetOptions {
                path: path.into(),
                ..Default::default()
            },
        }
    }

    /// Keep or drop the UA regex rules
    ///
    /// Default: kept.
    pub fn ua_rules(mut self, enabled: bool) -> Self {
        self.options.ua_rules = enabled;
        self
    }

    /// Load and compile the dataset
    pub fn open(self) -> Result<CompiledTree, DatasetError> {
        CompiledTree::open_with_options(&self.options)
    }
}

/// The compiled reference dataset
///
/// Immutable after construction and `Send + Sync`; wrap it in an `Arc` to
/// share it across threads.
#[derive(Debug)]
pub struct CompiledTree {
    info: DatasetInfo,
    attributes: IdTable<Attribute>,
    by_name: FxHashMap<String, AttributeId>,
    values: IdTable<Value>,
    root: Node,
    normalizers: IdTable<Regex>,
    ua_rules: Option<UaRules>,
    client_rules: Option<ClientRules>,
    shard: Option<String>,
}

impl CompiledTree {
    /// Start configuring a dataset load from `path`
    pub fn from(path: impl Into<PathBuf>) -> DatasetOpener {
        DatasetOpener::new(path)
    }

    /// Load with explicit options
    pub fn open_with_options(options: &DatasetOptions) -> Result<Self, DatasetError> {
        let doc = Document::from_path(&options.path)?;
        let tree = Self::from_document(doc, options.ua_rules)?;
        debug!(
            path = %options.path.display(),
            revision = tree.revision(),
            nodes = tree.root.node_count(),
            "dataset loaded"
        );
        Ok(tree)
    }

    /// Compile a dataset from JSON bytes (UA rules kept)
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DatasetError> {
        Self::from_document(Document::from_slice(bytes)?, true)
    }

    /// Compile a parsed document
    pub fn from_document(doc: Document, ua_rules: bool) -> Result<Self, DatasetError> {
        let info = doc.info()?.clone();

        let attributes = doc.attributes.try_map(|id, prefixed| {
            TypeTag::split_prefixed(prefixed)
                .map(|(tag, name)| Attribute {
                    name: name.to_string(),
                    tag,
                })
                .ok_or_else(|| DatasetError::BadData(format!("attribute {} has an empty name", id)))
        })?;
        let by_name = attributes
            .iter()
            .map(|(id, attr)| (attr.name.clone(), id))
            .collect();

        let normalizers = match doc.normalizer_patterns() {
            Some(table) => compile_table(table)?,
            None => IdTable::new(),
        };

        let ua_rules = match (&doc.ua_rules, ua_rules) {
            (Some(section), true) => Some(UaRules::compile(section)?),
            _ => None,
        };

        let client_rules = match &doc.client_rules {
            Some(section) => Some(ClientRules::compile(section, &attributes, &doc.values)?),
            None => None,
        };

        Ok(Self {
            info,
            attributes,
            by_name,
            values: doc.values,
            root: doc.root,
            normalizers,
            ua_rules,
            client_rules,
            shard: None,
        })
    }

    pub(crate) fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = Some(shard.into());
        self
    }

    /// Dataset header
    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    /// Dataset revision number
    pub fn revision(&self) -> u64 {
        self.info.revision_number()
    }

    /// Generation time as a unix timestamp
    pub fn generated_at(&self) -> i64 {
        self.info.generated_at as i64
    }

    /// Generation label
    pub fn generation(&self) -> &str {
        &self.info.generation
    }

    /// Shard key this tree was loaded from, `None` for the full dataset
    pub fn shard(&self) -> Option<&str> {
        self.shard.as_deref()
    }

    /// Every attribute name with its declared type
    pub fn list_attributes(&self) -> BTreeMap<String, TypeTag> {
        self.attributes
            .iter()
            .map(|(_, attr)| (attr.name.clone(), attr.tag))
            .collect()
    }

    /// Attribute id for a bare name
    pub fn attribute_id(&self, name: &str) -> Option<AttributeId> {
        self.by_name.get(name).copied()
    }

    /// Attribute for an id
    pub fn attribute(&self, id: AttributeId) -> Option<&Attribute> {
        self.attributes.get(id)
    }

    /// Bare name for an id
    pub fn attribute_name(&self, id: AttributeId) -> Option<&str> {
        self.attributes.get(id).map(|a| a.name.as_str())
    }

    /// Type-prefixed name for an id (`"bisMobile"`)
    pub fn prefixed_name(&self, id: AttributeId) -> Option<String> {
        self.attributes
            .get(id)
            .map(|a| format!("{}{}", a.tag.prefix(), a.name))
    }

    /// Declared type of a bare name
    pub fn attribute_type(&self, name: &str) -> Option<TypeTag> {
        self.attribute_id(name)
            .and_then(|id| self.attributes.get(id))
            .map(|a| a.tag)
    }

    /// Raw stored value
    pub fn raw_value(&self, id: ValueId) -> Option<&Value> {
        self.values.get(id)
    }

    /// Value of `attribute`, typed by its declared type when `typed` is set
    pub fn value(&self, attribute: AttributeId, id: ValueId, typed: bool) -> Option<Value> {
        let raw = self.values.get(id)?;
        Some(if typed {
            self.typed_value(attribute, raw)
        } else {
            raw.clone()
        })
    }

    /// Convert a raw value to the declared type of `attribute`
    ///
    /// Unknown attributes pass the value through.
    pub fn typed_value(&self, attribute: AttributeId, raw: &Value) -> Value {
        let tag = self
            .attributes
            .get(attribute)
            .map_or(TypeTag::Unknown, |a| a.tag);
        raw.typed(tag)
    }

    /// Trie root
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Compiled normalization regexes
    pub fn normalizers(&self) -> &IdTable<Regex> {
        &self.normalizers
    }

    /// UA regex rules, if loaded
    pub fn ua_rules(&self) -> Option<&UaRules> {
        self.ua_rules.as_ref()
    }

    /// Client property rules, if the dataset has them
    pub fn client_rules(&self) -> Option<&ClientRules> {
        self.client_rules.as_ref()
    }

    /// Number of attributes
    pub fn attribute_count(&self) -> usize {
        self.attributes.iter().count()
    }

    /// Number of stored values
    pub fn value_count(&self) -> usize {
        self.values.iter().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATASET: &str = r#"{
        "$": {"Ver": 0.7, "Gen": "2024-03-01", "Utc": 1709251200, "Rev": "$Rev: 512 $"},
        "p": ["bisMobile", "iyearReleased", "svendor", "dreleaseDate", "uodd"],
        "v": ["1", "2019", "Apple", "2019-09", 3.5, "true", 0],
        "t": {},
        "r": {"1": ["\\s+"]}
    }"#;

    fn tree() -> CompiledTree {
        CompiledTree::from_slice(DATASET.as_bytes()).unwrap()
    }

    #[test]
    fn test_info() {
        let tree = tree();
        assert_eq!(tree.revision(), 512);
        assert_eq!(tree.generated_at(), 1_709_251_200);
        assert_eq!(tree.generation(), "2024-03-01");
        assert!(tree.shard().is_none());
        assert_eq!(tree.normalizers().len(), 1);
    }

    #[test]
    fn test_list_attributes() {
        let attrs = tree().list_attributes();
        assert_eq!(attrs.get("isMobile"), Some(&TypeTag::Boolean));
        assert_eq!(attrs.get("yearReleased"), Some(&TypeTag::Integer));
        assert_eq!(attrs.get("vendor"), Some(&TypeTag::String));
        assert_eq!(attrs.get("releaseDate"), Some(&TypeTag::Date));
        assert_eq!(attrs.get("odd"), Some(&TypeTag::Unknown));
        assert_eq!(attrs.len(), 5);
    }

    #[test]
    fn test_name_resolution() {
        let tree = tree();
        assert_eq!(tree.attribute_id("vendor"), Some(2));
        assert_eq!(tree.attribute_id("bvendor"), None);
        assert_eq!(tree.attribute_name(0), Some("isMobile"));
        assert_eq!(tree.prefixed_name(1).as_deref(), Some("iyearReleased"));
        assert_eq!(tree.attribute_type("releaseDate"), Some(TypeTag::Date));
    }

    #[test]
    fn test_typed_values() {
        let tree = tree();
        assert_eq!(tree.value(0, 0, true), Some(Value::Bool(true)));
        assert_eq!(tree.value(0, 5, true), Some(Value::Bool(true)));
        assert_eq!(tree.value(0, 6, true), Some(Value::Bool(false)));
        assert_eq!(tree.value(1, 1, true), Some(Value::Int(2019)));
        assert_eq!(tree.value(1, 4, true), Some(Value::Int(3)));
        assert_eq!(tree.value(2, 2, true), Some(Value::from("Apple")));
        assert_eq!(tree.value(3, 3, true), Some(Value::from("2019-09")));
        assert_eq!(tree.value(4, 4, true), Some(Value::Float(3.5)));
        assert_eq!(tree.value(1, 1, false), Some(Value::from("2019")));
        assert_eq!(tree.value(1, 99, true), None);
    }

    #[test]
    fn test_ua_rules_switch() {
        let json = DATASET.replace(
            "\"t\": {},",
            r#""t": {}, "uar": {"rg": [], "sk": [], "reg": {"d": []}},"#,
        );
        let doc = Document::from_slice(json.as_bytes()).unwrap();
        assert!(CompiledTree::from_document(doc.clone(), true).unwrap().ua_rules().is_some());
        assert!(CompiledTree::from_document(doc, false).unwrap().ua_rules().is_none());
    }

    #[test]
    fn test_invalid_normalizer_fails_load() {
        let json = DATASET.replace(r#"["\\s+"]"#, r#"["(oops"]"#);
        let err = CompiledTree::from_slice(json.as_bytes()).unwrap_err();
        assert!(matches!(err, DatasetError::InvalidRegex { id: 0, .. }));
    }
}
