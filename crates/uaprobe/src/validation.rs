//! Dataset validation
//!
//! Loading a dataset only checks what lookups cannot do without. This module
//! checks the rest:
//!
//! - attribute, value and regex ids referenced by nodes and rules exist
//! - volatile entries are a subset of a node's values
//! - no child edge is shadowed by a sibling that prefixes it
//! - non-volatile attributes are never given a different value deeper down
//! - client rule operators are usable with the attribute's type
//!
//! ```rust,no_run
//! use uaprobe::validation::{validate_file, ValidationLevel};
//!
//! let report = validate_file("devices.json", ValidationLevel::Strict)?;
//! if !report.is_valid() {
//!     for error in &report.errors {
//!         eprintln!("  ERROR: {}", error);
//!     }
//! }
//! println!("{}", report.stats.summary());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::document::{ClientRulesDoc, Document, UaRulesDoc};
use crate::error::DatasetError;
use crate::rules::{compile_pattern, Operator};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::path::Path;
use uaprobe_trie::Node;
use uaprobe_value::{AttributeId, IdTable, TypeTag, ValueId};

/// Validation strictness level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationLevel {
    /// Reference checks only
    Standard,
    /// Reference checks plus shadowed edges and the volatility invariant
    Strict,
}

/// Validation findings
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Problems that make lookups wrong
    pub errors: Vec<String>,
    /// Suspicious but harmless content
    pub warnings: Vec<String>,
    /// Facts about the dataset
    pub info: Vec<String>,
    /// Dataset statistics
    pub stats: DatasetStats,
}

/// Statistics gathered during validation
#[derive(Debug, Clone, Default)]
pub struct DatasetStats {
    /// Schema version
    pub version: f64,
    /// Revision number
    pub revision: u64,
    /// Number of attributes
    pub attributes: usize,
    /// Number of stored values
    pub values: usize,
    /// Values no node or rule refers to
    pub unused_values: usize,
    /// Trie nodes, root included
    pub nodes: usize,
    /// Longest edge path from the root
    pub max_depth: usize,
    /// Normalization regexes
    pub normalizers: usize,
    /// UA rule groups
    pub ua_rule_groups: usize,
    /// Client rule groups
    pub client_rule_groups: usize,
}

impl ValidationReport {
    /// Whether no error was found
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn info(&mut self, msg: impl Into<String>) {
        self.info.push(msg.into());
    }
}

impl DatasetStats {
    /// Human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Version: {}, Revision: {}, Attributes: {}, Values: {} ({} unused), Nodes: {} (depth {}), Rules: {} UA / {} client",
            self.version,
            self.revision,
            self.attributes,
            self.values,
            self.unused_values,
            self.nodes,
            self.max_depth,
            self.ua_rule_groups,
            self.client_rule_groups
        )
    }
}

/// Validate a dataset file
///
/// Read failures are returned as errors; a document that does not parse is
/// reported in [`ValidationReport::errors`].
pub fn validate_file(path: impl AsRef<Path>, level: ValidationLevel) -> Result<ValidationReport, DatasetError> {
    match Document::from_path(path) {
        Ok(doc) => Ok(validate_document(&doc, level)),
        Err(e @ DatasetError::Io { .. }) => Err(e),
        Err(e) => {
            let mut report = ValidationReport::default();
            report.error(format!("cannot load dataset: {}", e));
            Ok(report)
        }
    }
}

/// Validate a parsed document
pub fn validate_document(doc: &Document, level: ValidationLevel) -> ValidationReport {
    let mut report = ValidationReport::default();

    if let Some(info) = &doc.info {
        report.stats.version = info.version;
        report.stats.revision = info.revision_number();
        report.info(format!(
            "schema {} revision {} generated {}",
            info.version,
            info.revision_number(),
            info.generation
        ));
    }

    let tags = check_attributes(doc, &mut report);
    report.stats.values = doc.values.len();

    let normalizers = doc.normalizer_patterns();
    report.stats.normalizers = normalizers.map_or(0, IdTable::len);
    if let Some(table) = normalizers {
        for (id, pattern) in table.iter() {
            if let Err(e) = compile_pattern(id, pattern) {
                report.error(e.to_string());
            }
        }
    }

    let mut walker = TreeCheck {
        doc,
        level,
        report: &mut report,
        used: BTreeSet::new(),
        max_depth: 0,
        nodes: 0,
    };
    let mut path = Vec::new();
    walker.node(&doc.root, &mut path, &FxHashMap::default());
    let (mut used, nodes, max_depth) = (walker.used, walker.nodes, walker.max_depth);
    report.stats.nodes = nodes;
    report.stats.max_depth = max_depth;

    if let Some(uar) = &doc.ua_rules {
        report.stats.ua_rule_groups = uar.groups.len();
        check_ua_rules(doc, uar, &mut report);
        used.extend(uar.value_ids());
    }
    if let Some(cpr) = &doc.client_rules {
        report.stats.client_rule_groups = cpr.groups.len();
        check_client_rules(doc, cpr, &tags, &mut report);
        used.extend(cpr.value_ids());
    }

    report.stats.unused_values = doc
        .values
        .iter()
        .filter(|(id, _)| !used.contains(id))
        .count();
    if report.stats.unused_values > 0 {
        report.info(format!("{} values are never referenced", report.stats.unused_values));
    }

    report
}

fn check_attributes(doc: &Document, report: &mut ValidationReport) -> FxHashMap<AttributeId, TypeTag> {
    let mut tags = FxHashMap::default();
    let mut names: FxHashMap<&str, AttributeId> = FxHashMap::default();

    for (id, prefixed) in doc.attributes.iter() {
        let Some((tag, name)) = TypeTag::split_prefixed(prefixed) else {
            report.error(format!("attribute {} has an empty name", id));
            continue;
        };
        if tag == TypeTag::Unknown {
            report.warning(format!("attribute {} {:?} has an unknown type prefix", id, prefixed));
        }
        if let Some(other) = names.insert(name, id) {
            report.error(format!("attributes {} and {} are both named {:?}", other, id, name));
        }
        tags.insert(id, tag);
    }

    report.stats.attributes = tags.len();
    tags
}

struct TreeCheck<'a, 'r> {
    doc: &'a Document,
    level: ValidationLevel,
    report: &'r mut ValidationReport,
    used: BTreeSet<ValueId>,
    max_depth: usize,
    nodes: usize,
}

impl<'a> TreeCheck<'a, '_> {
    /// `fixed` holds the non-volatile values set above this node
    fn node(&mut self, node: &'a Node, path: &mut Vec<&'a str>, fixed: &FxHashMap<AttributeId, ValueId>) {
        self.nodes += 1;
        self.max_depth = self.max_depth.max(path.len());
        let at = display_path(path);

        for (attr, value) in &node.values {
            if !self.doc.attributes.contains(*attr) {
                self.report.error(format!("node {}: unknown attribute {}", at, attr));
            }
            if !self.doc.values.contains(*value) {
                self.report.error(format!("node {}: unknown value {} for attribute {}", at, value, attr));
            }
            self.used.insert(*value);
        }
        for (attr, value) in &node.volatile {
            self.used.insert(*value);
            match node.values.get(attr) {
                None => self
                    .report
                    .error(format!("node {}: volatile attribute {} has no value", at, attr)),
                Some(v) if v != value => self.report.warning(format!(
                    "node {}: volatile attribute {} disagrees with its value ({} vs {})",
                    at, attr, value, v
                )),
                Some(_) => {}
            }
        }
        for rule in &node.rules {
            let known = self
                .doc
                .normalizer_patterns()
                .is_some_and(|table| table.contains(*rule));
            if !known {
                self.report
                    .error(format!("node {}: unknown normalization rule {}", at, rule));
            }
        }

        let mut below = fixed.clone();
        if self.level == ValidationLevel::Strict {
            for (attr, value) in &node.values {
                if let Some(previous) = fixed.get(attr) {
                    if previous != value {
                        self.report.error(format!(
                            "node {}: non-volatile attribute {} changes from {} to {}",
                            at, attr, previous, value
                        ));
                    }
                }
                if !node.volatile.contains_key(attr) {
                    below.insert(*attr, *value);
                }
            }
            self.shadowed_edges(node, &at);
        }

        for (edge, child) in node.children() {
            path.push(edge);
            self.node(child, path, &below);
            path.pop();
        }
    }

    fn shadowed_edges(&mut self, node: &Node, at: &str) {
        for edge in node.children().keys() {
            let shorter = edge
                .char_indices()
                .skip(1)
                .map(|(i, _)| &edge[..i])
                .find(|prefix| node.child(prefix).is_some());
            if let Some(prefix) = shorter {
                self.report.warning(format!(
                    "node {}: edge {:?} is unreachable behind {:?}",
                    at, edge, prefix
                ));
            }
        }
    }
}

fn display_path(path: &[&str]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        format!("{:?}", path.concat())
    }
}

fn check_ua_rules(doc: &Document, uar: &UaRulesDoc, report: &mut ValidationReport) {
    let regexes = uar.regex_table();
    if regexes.is_none() && !uar.groups.is_empty() {
        report.error("UA rules have no regex table");
    }
    if let Some(table) = regexes {
        for (id, pattern) in table.iter() {
            if let Err(e) = compile_pattern(id, pattern) {
                report.error(format!("UA rules: {}", e));
            }
        }
    }
    let regex_known = |id: u32| regexes.is_some_and(|t| t.contains(id));

    for attr in &uar.skip {
        if !doc.attributes.contains(*attr) {
            report.error(format!("UA skip list: unknown attribute {}", attr));
        }
    }

    for (g, group) in uar.groups.iter().enumerate() {
        for (attr, value) in group.matcher.iter().flat_map(|m| m.iter()) {
            if !doc.attributes.contains(attr) {
                report.error(format!("UA group {}: unknown attribute {}", g, attr));
            }
            if !doc.values.contains(*value) {
                report.error(format!("UA group {}: unknown value {}", g, value));
            }
        }
        if group.sets.len() > 1 && group.matcher.is_some() && group.sets.iter().any(|s| s.refine.is_none()) {
            report.warning(format!("UA group {}: rule list without a refine regex can never be chosen", g));
        }

        for set in &group.sets {
            for id in set.refine.iter().chain(set.search.iter()) {
                if !regex_known(*id) {
                    report.error(format!("UA group {}: unknown regex {}", g, id));
                }
            }
            for rule in &set.rules {
                if !doc.attributes.contains(rule.attribute) {
                    report.error(format!("UA group {}: rule for unknown attribute {}", g, rule.attribute));
                }
                match (rule.value, rule.regex) {
                    (Some(value), _) if !doc.values.contains(value) => {
                        report.error(format!("UA group {}: unknown value {}", g, value))
                    }
                    (None, Some(regex)) if !regex_known(regex) => {
                        report.error(format!("UA group {}: unknown regex {}", g, regex))
                    }
                    (None, None) => report.error(format!(
                        "UA group {}: rule for attribute {} has neither value nor regex",
                        g, rule.attribute
                    )),
                    _ => {}
                }
            }
        }
    }
}

fn check_client_rules(
    doc: &Document,
    cpr: &ClientRulesDoc,
    tags: &FxHashMap<AttributeId, TypeTag>,
    report: &mut ValidationReport,
) {
    let mut substitutes = FxHashSet::default();

    for (g, group) in cpr.groups.iter().enumerate() {
        if group.matchers.is_empty() {
            report.warning(format!("client group {}: no conditions, always selected", g));
        }
        for matcher in &group.matchers {
            let Some(tag) = tags.get(&matcher.attribute) else {
                report.error(format!("client group {}: unknown attribute {}", g, matcher.attribute));
                continue;
            };
            if !doc.values.contains(matcher.value) {
                report.error(format!("client group {}: unknown value {}", g, matcher.value));
            }
            match matcher.operator.parse::<Operator>() {
                Err(e) => report.error(format!("client group {}: {}", g, e)),
                Ok(op) => {
                    let usable = match tag {
                        TypeTag::Integer => true,
                        TypeTag::String | TypeTag::Boolean => matches!(op, Operator::Eq | Operator::Ne),
                        TypeTag::Date | TypeTag::Unknown => false,
                    };
                    if !usable {
                        report.warning(format!(
                            "client group {}: operator {} on {} attribute {} never matches",
                            g, op, tag, matcher.attribute
                        ));
                    }
                }
            }
        }
        for rule in &group.rules {
            if !doc.attributes.contains(rule.attribute) {
                report.error(format!("client group {}: rule for unknown attribute {}", g, rule.attribute));
            }
            if !doc.values.contains(rule.value) {
                report.error(format!("client group {}: unknown value {}", g, rule.value));
            }
        }
        if let Some(ua) = group.substitute.as_deref() {
            if ua.is_empty() {
                report.warning(format!("client group {}: empty substitute string", g));
            } else {
                substitutes.insert(ua);
            }
        }
    }

    if !substitutes.is_empty() {
        report.info(format!("{} distinct substitute strings", substitutes.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../tests/data/sample.json");

    fn sample() -> Document {
        Document::from_slice(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_sample_is_valid() {
        let report = validate_document(&sample(), ValidationLevel::Strict);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.stats.attributes, 13);
        assert_eq!(report.stats.unused_values, 1);
        assert_eq!(report.stats.max_depth, 3);
        assert_eq!(report.stats.revision, 28419);
        assert_eq!(report.stats.ua_rule_groups, 2);
        assert_eq!(report.stats.client_rule_groups, 2);
    }

    #[test]
    fn test_dangling_ids() {
        let mut doc = sample();
        let node = doc.root.child_mut("Googlebot").unwrap();
        node.values.insert(99, 0);
        node.values.insert(7, 500);
        node.rules.push(42);

        let report = validate_document(&doc, ValidationLevel::Standard);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("unknown attribute 99")));
        assert!(report.errors.iter().any(|e| e.contains("unknown value 500")));
        assert!(report.errors.iter().any(|e| e.contains("normalization rule 42")));
    }

    #[test]
    fn test_volatility_invariant() {
        let mut doc = sample();
        // make isRobot final at the root; Googlebot then contradicts it
        doc.root.volatile.remove(&9);

        let report = validate_document(&doc, ValidationLevel::Strict);
        assert!(!report.is_valid());
        assert!(report.errors[0].contains("non-volatile attribute 9"));

        let report = validate_document(&doc, ValidationLevel::Standard);
        assert!(report.is_valid());
    }

    #[test]
    fn test_volatile_without_value() {
        let mut doc = sample();
        doc.root.values.remove(&1);
        let report = validate_document(&doc, ValidationLevel::Standard);
        assert!(report.errors.iter().any(|e| e.contains("volatile attribute 1 has no value")));
    }

    #[test]
    fn test_shadowed_edge() {
        let mut doc = sample();
        doc.root.insert_child("Moz", Node::new());
        let report = validate_document(&doc, ValidationLevel::Strict);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("unreachable behind \"Moz\"")));
    }

    #[test]
    fn test_client_operator_on_string() {
        let json = SAMPLE.replace(r#"{"p": 3, "v": 2, "o": "="}"#, r#"{"p": 3, "v": 2, "o": ">"}"#);
        let doc = Document::from_slice(json.as_bytes()).unwrap();
        let report = validate_document(&doc, ValidationLevel::Standard);
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("never matches")));
    }

    #[test]
    fn test_validate_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        std::fs::write(&path, SAMPLE.replace("\"Ver\": 0.7", "\"Ver\": 0.5")).unwrap();
        let report = validate_file(&path, ValidationLevel::Standard).unwrap();
        assert!(!report.is_valid());

        assert!(validate_file(dir.path().join("absent.json"), ValidationLevel::Standard).is_err());
    }
}
