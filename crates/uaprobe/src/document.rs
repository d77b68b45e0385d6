//! Wire form of a compiled dataset
//!
//! [`Document`] mirrors the JSON produced by the dataset generator, field for
//! field, using the generator's short tags. It is what gets read from disk,
//! what the shard optimizer rewrites, and what shard files contain. Lookups
//! never touch it directly: [`CompiledTree`](crate::CompiledTree) is built
//! from it once per load.

use crate::error::DatasetError;
use memmap2::Mmap;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use uaprobe_trie::Node;
use uaprobe_value::{AttributeId, IdTable, Value, ValueId};

/// Oldest schema version this library can read
pub const MIN_SCHEMA_VERSION: f64 = 0.7;

/// Normalization regex table used by this library
pub const API_ID: u32 = 1;

/// Key of the default UA-rule regex table
pub const DEFAULT_REGEX_SET: &str = "d";

/// Dataset header (`$`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Schema version (`Ver`)
    #[serde(rename = "Ver", default, deserialize_with = "number_or_string")]
    pub version: f64,
    /// Generation label (`Gen`)
    #[serde(rename = "Gen", default)]
    pub generation: String,
    /// Generation time as a unix timestamp (`Utc`)
    #[serde(rename = "Utc", default, deserialize_with = "number_or_string")]
    pub generated_at: f64,
    /// Revision keyword, e.g. `"$Rev: 28419 $"` (`Rev`)
    #[serde(rename = "Rev", default)]
    pub revision: String,
}

impl DatasetInfo {
    /// Revision number extracted from the revision keyword
    pub fn revision_number(&self) -> u64 {
        self.revision
            .trim_matches(|c: char| c == '$' || c.is_whitespace())
            .trim_start_matches("Rev:")
            .trim()
            .parse()
            .unwrap_or(0)
    }
}

/// A complete dataset document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    /// Header
    #[serde(rename = "$", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<DatasetInfo>,

    /// Attribute id → type-prefixed name
    #[serde(rename = "p", default)]
    pub attributes: IdTable<String>,

    /// Value id → raw scalar
    #[serde(rename = "v", default)]
    pub values: IdTable<Value>,

    /// Trie root
    #[serde(rename = "t", default)]
    pub root: Node,

    /// API id → normalization patterns
    #[serde(rename = "r", default, skip_serializing_if = "IdTable::is_empty")]
    pub normalizers: IdTable<IdTable<String>>,

    /// UA regex rules
    #[serde(rename = "uar", default, skip_serializing_if = "Option::is_none")]
    pub ua_rules: Option<UaRulesDoc>,

    /// Client property rules
    #[serde(rename = "cpr", default, skip_serializing_if = "Option::is_none")]
    pub client_rules: Option<ClientRulesDoc>,
}

/// UA rule section (`uar`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UaRulesDoc {
    /// Rule groups, in evaluation order
    #[serde(rename = "rg", default)]
    pub groups: Vec<UaGroupDoc>,
    /// Attributes that, when truthy after the walk, disable the UA rules
    #[serde(rename = "sk", default)]
    pub skip: Vec<AttributeId>,
    /// Regex tables keyed by `d` (default) or an API id
    #[serde(rename = "reg", default)]
    pub regexes: BTreeMap<String, IdTable<String>>,
}

/// One UA rule group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UaGroupDoc {
    /// Required attribute values (attribute id → value id)
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub matcher: Option<IdTable<ValueId>>,
    /// Candidate rule lists
    #[serde(rename = "t", default)]
    pub sets: Vec<UaRuleSetDoc>,
}

/// A candidate rule list with its selecting regexes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UaRuleSetDoc {
    /// Regex used to pick this list after a property match
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub refine: Option<u32>,
    /// Regex used to pick this list without a property match
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub search: Option<u32>,
    /// Rules to run
    #[serde(rename = "r", default)]
    pub rules: Vec<UaRuleDoc>,
}

/// A single UA rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UaRuleDoc {
    /// Output attribute
    #[serde(rename = "p")]
    pub attribute: AttributeId,
    /// Fixed value
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValueId>,
    /// Extraction regex
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<u32>,
    /// Capture group of the extraction regex
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

/// Client rule section (`cpr`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRulesDoc {
    /// Rule groups, in evaluation order
    #[serde(rename = "rg", default)]
    pub groups: Vec<ClientGroupDoc>,
}

/// One client rule group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientGroupDoc {
    /// Conditions, all of which must hold
    #[serde(rename = "p", default)]
    pub matchers: Vec<ClientMatcherDoc>,
    /// Substitute identification string for a second walk
    #[serde(rename = "ua", default, skip_serializing_if = "Option::is_none")]
    pub substitute: Option<String>,
    /// Overrides applied when the group is selected
    #[serde(rename = "r", default)]
    pub rules: Vec<ClientRuleDoc>,
}

/// A client rule condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMatcherDoc {
    /// Attribute compared
    #[serde(rename = "p")]
    pub attribute: AttributeId,
    /// Expected value
    #[serde(rename = "v")]
    pub value: ValueId,
    /// Comparison operator (`=`, `!=`, `<`, `<=`, `>`, `>=`)
    #[serde(rename = "o")]
    pub operator: String,
}

/// A client rule override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRuleDoc {
    /// Attribute set
    #[serde(rename = "p")]
    pub attribute: AttributeId,
    /// Value set
    #[serde(rename = "v")]
    pub value: ValueId,
}

impl Document {
    /// Parse a document from JSON bytes and check its header
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DatasetError> {
        let doc: Document = serde_json::from_slice(bytes)?;
        doc.check_header()?;
        Ok(doc)
    }

    /// Read and parse a document from a file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| DatasetError::io(path, e))?;
        let len = file.metadata().map_err(|e| DatasetError::io(path, e))?.len();
        if len == 0 {
            return Err(DatasetError::BadData(format!("{} is empty", path.display())));
        }

        // SAFETY: the map is read-only and dropped before this function
        // returns. Writers replace dataset files by rename, so the mapped
        // inode is not modified underneath us.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DatasetError::io(path, e))?;
        Self::from_slice(&mmap)
    }

    /// Write the document as JSON
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| DatasetError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(|e| DatasetError::io(path, e))?;
        Ok(())
    }

    /// Write the document through a temporary file in the same directory,
    /// then rename it over `path`
    pub fn write_atomic(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let tmp = NamedTempFile::new_in(dir).map_err(|e| DatasetError::io(dir, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, self)?;
            writer.flush().map_err(|e| DatasetError::io(tmp.path(), e))?;
        }
        tmp.persist(path)
            .map_err(|e| DatasetError::io(path, e.error))?;
        Ok(())
    }

    /// Header, which [`Document::from_slice`] guarantees to be present
    pub fn info(&self) -> Result<&DatasetInfo, DatasetError> {
        self.info
            .as_ref()
            .ok_or_else(|| DatasetError::BadData("missing header".to_string()))
    }

    /// Normalization patterns used by this library
    pub fn normalizer_patterns(&self) -> Option<&IdTable<String>> {
        self.normalizers.get(API_ID)
    }

    /// Copy of everything except the trie
    pub fn shell(&self) -> Document {
        Document {
            info: self.info.clone(),
            attributes: self.attributes.clone(),
            values: self.values.clone(),
            root: Node::default(),
            normalizers: self.normalizers.clone(),
            ua_rules: self.ua_rules.clone(),
            client_rules: self.client_rules.clone(),
        }
    }

    fn check_header(&self) -> Result<(), DatasetError> {
        let info = self.info()?;
        if info.version.is_nan() || info.version < MIN_SCHEMA_VERSION {
            return Err(DatasetError::UnsupportedVersion {
                found: info.version,
                minimum: MIN_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

impl UaRulesDoc {
    /// Regex table used by this library: the API-specific one if present, else the default
    pub fn regex_table(&self) -> Option<&IdTable<String>> {
        self.regexes
            .get(&API_ID.to_string())
            .or_else(|| self.regexes.get(DEFAULT_REGEX_SET))
    }

    /// Every value id referenced by matchers and fixed-value rules
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.groups.iter().flat_map(|group| {
            let matched = group
                .matcher
                .iter()
                .flat_map(|m| m.iter().map(|(_, v)| *v));
            let fixed = group
                .sets
                .iter()
                .flat_map(|set| set.rules.iter().filter_map(|r| r.value));
            matched.chain(fixed)
        })
    }

    /// Rewrite every value id reference
    pub fn remap_values(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        for group in &mut self.groups {
            if let Some(matcher) = group.matcher.as_mut() {
                let mut remapped = IdTable::new();
                for (attr, value) in matcher.iter() {
                    remapped.insert(attr, f(*value));
                }
                *matcher = remapped;
            }
            for set in &mut group.sets {
                for rule in &mut set.rules {
                    if let Some(value) = rule.value.as_mut() {
                        *value = f(*value);
                    }
                }
            }
        }
    }
}

impl ClientRulesDoc {
    /// Every value id referenced by conditions and overrides
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.groups.iter().flat_map(|group| {
            group
                .matchers
                .iter()
                .map(|m| m.value)
                .chain(group.rules.iter().map(|r| r.value))
        })
    }

    /// Rewrite every value id reference
    pub fn remap_values(&mut self, mut f: impl FnMut(ValueId) -> ValueId) {
        for group in &mut self.groups {
            for matcher in &mut group.matchers {
                matcher.value = f(matcher.value);
            }
            for rule in &mut group.rules {
                rule.value = f(rule.value);
            }
        }
    }

    /// Distinct substitute strings, in first-seen order
    pub fn substitutes(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for ua in self.groups.iter().filter_map(|g| g.substitute.as_deref()) {
            if !seen.contains(&ua) {
                seen.push(ua);
            }
        }
        seen
    }
}

// Older generators quote some header numbers.
fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
        Null,
    }

    match Repr::deserialize(deserializer)? {
        Repr::Number(n) => Ok(n),
        Repr::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected a number, got {:?}", s))),
        Repr::Null => Ok(0.0),
    }
}
