//! Lookup API
//!
//! A bulk [`lookup`](CompiledTree::lookup) walks the whole trie, runs the UA
//! rules and, when a client overlay is given, the client rules. A
//! [`lookup_single`](CompiledTree::lookup_single) asks the walk for just the
//! attributes it needs and stops as soon as they are final.

use crate::dataset::CompiledTree;
use crate::error::{DatasetError, Result, UaprobeError};
use crate::overlay::ClientOverlay;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;
use uaprobe_trie::{Walk, Wanted};
use uaprobe_value::{AttributeId, TypeTag, Value};

/// Attributes resolved for one input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    attributes: BTreeMap<String, Value>,
    #[serde(default)]
    matched: String,
    #[serde(default)]
    unmatched: String,
}

impl Properties {
    /// Value of `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Whether `name` has a value
    pub fn contains(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    /// Set `name`, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    /// Remove `name`
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Take the attributes of `other` this set has no value for
    ///
    /// `matched` and `unmatched` are left as they are.
    pub fn fill_missing(&mut self, other: Properties) {
        for (name, value) in other.attributes {
            self.attributes.entry(name).or_insert(value);
        }
    }

    /// Attributes in name order
    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.attributes.iter()
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether no attribute was resolved
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Part of the input consumed by trie edges
    pub fn matched(&self) -> &str {
        &self.matched
    }

    /// Remaining input when the walk stopped
    pub fn unmatched(&self) -> &str {
        &self.unmatched
    }

    /// Attribute map
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Consume into the attribute map
    pub fn into_attributes(self) -> BTreeMap<String, Value> {
        self.attributes
    }
}

impl<'a> IntoIterator for &'a Properties {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.iter()
    }
}

impl CompiledTree {
    /// Resolve every attribute for `input`
    ///
    /// `overlay` is a client overlay in wire form; an empty string counts as
    /// none. With `typed` set, values are converted to their declared types.
    pub fn lookup(&self, input: &str, overlay: Option<&str>, typed: bool) -> Result<Properties> {
        let input = input.trim();
        let overlay = self.parse_overlay(overlay)?;

        let walk = self.root().walk(self.normalizers(), input, Wanted::All);
        let mut props = self.properties_from_walk(&walk, typed);
        props.matched = walk.matched.clone();
        props.unmatched = walk.unmatched.clone();

        if let Some(ua_rules) = self.ua_rules() {
            for (attr, value) in ua_rules.extract(self, &walk.found, input, None, typed) {
                if let Some(name) = self.attribute_name(attr) {
                    props.insert(name, value);
                }
            }
        }

        if let Some(overlay) = overlay {
            if let Some(client_rules) = self.client_rules() {
                client_rules.apply(self, &mut props, &overlay, typed);
            }
        }

        Ok(props)
    }

    /// Resolve one attribute for `input`, typed
    ///
    /// Fails with [`UaprobeError::UnknownAttribute`] when neither the dataset
    /// nor the overlay knows `name`, and with
    /// [`UaprobeError::InvalidAttribute`] when it has no value for `input`.
    pub fn lookup_single(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<Value> {
        let input = input.trim();
        let overlay = self.parse_overlay(overlay)?;
        let attr = self.attribute_id(name);

        if let Some(overlay) = &overlay {
            let rule_output = match (attr, self.client_rules()) {
                (Some(id), Some(rules)) => rules.outputs(id),
                _ => false,
            };
            if !rule_output {
                if let Some(entry) = overlay.get(name) {
                    return Ok(entry.typed());
                }
            }
        }

        let attr = attr.ok_or_else(|| UaprobeError::UnknownAttribute(name.to_string()))?;
        let props = self.properties_for(input, attr, overlay.as_ref())?;

        props
            .get(name)
            .cloned()
            .ok_or_else(|| UaprobeError::InvalidAttribute {
                name: name.to_string(),
                input: input.to_string(),
            })
    }

    /// Boolean attribute
    pub fn lookup_bool(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<bool> {
        self.check_type(name, overlay, TypeTag::Boolean)?;
        Ok(self.lookup_single(input, name, overlay)?.cast_bool())
    }

    /// Integer attribute
    pub fn lookup_int(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<i64> {
        self.check_type(name, overlay, TypeTag::Integer)?;
        Ok(self.lookup_single(input, name, overlay)?.cast_int())
    }

    /// String attribute
    pub fn lookup_string(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<String> {
        self.check_type(name, overlay, TypeTag::String)?;
        Ok(self.lookup_single(input, name, overlay)?.cast_string())
    }

    /// Date attribute, as its stored string
    pub fn lookup_date(&self, input: &str, name: &str, overlay: Option<&str>) -> Result<String> {
        self.check_type(name, overlay, TypeTag::Date)?;
        Ok(self.lookup_single(input, name, overlay)?.cast_string())
    }

    /// Second walk for a client rule substitute: every attribute, no UA rules
    ///
    /// Shards carry the result for substitutes routed elsewhere as a
    /// top-level child keyed by the full string.
    pub(crate) fn substitute_properties(&self, substitute: &str, typed: bool) -> Properties {
        if self.shard().is_some() {
            if let Some(synthetic) = self.root().child(substitute) {
                let mut found = self.root().values.clone();
                found.extend(synthetic.values.iter().map(|(k, v)| (*k, *v)));
                let walk = Walk {
                    found,
                    matched: substitute.to_string(),
                    unmatched: String::new(),
                };
                return self.properties_from_walk(&walk, typed);
            }
        }

        let walk = self.root().walk(self.normalizers(), substitute, Wanted::All);
        self.properties_from_walk(&walk, typed)
    }

    fn properties_from_walk(&self, walk: &Walk, typed: bool) -> Properties {
        let mut props = Properties::default();
        for (&attr, &vid) in &walk.found {
            if let (Some(name), Some(value)) = (self.attribute_name(attr), self.value(attr, vid, typed)) {
                props.insert(name, value);
            }
        }
        props
    }

    /// Collect just enough to answer for `attr`
    fn properties_for(
        &self,
        input: &str,
        attr: AttributeId,
        overlay: Option<&ClientOverlay>,
    ) -> Result<Properties> {
        let mut sought: FxHashSet<AttributeId> = FxHashSet::default();
        sought.insert(attr);
        if overlay.is_some() {
            if let Some(client_rules) = self.client_rules() {
                sought.extend(client_rules.required().iter().copied());
            }
        }

        let ua_rules = self
            .ua_rules()
            .filter(|rules| sought.iter().any(|id| rules.outputs(*id)));
        if let Some(rules) = ua_rules {
            sought.extend(rules.required().iter().copied());
        }

        let walk = self
            .root()
            .walk(self.normalizers(), input, Wanted::Only(&sought));
        let mut props = self.properties_from_walk(&walk, true);

        if let Some(rules) = ua_rules {
            for (id, value) in rules.extract(self, &walk.found, input, Some(&sought), true) {
                if let Some(name) = self.attribute_name(id) {
                    props.insert(name, value);
                }
            }
        }

        if let (Some(overlay), Some(client_rules)) = (overlay, self.client_rules()) {
            client_rules.apply(self, &mut props, overlay, true);
        }

        Ok(props)
    }

    fn parse_overlay(&self, overlay: Option<&str>) -> Result<Option<ClientOverlay>> {
        let Some(raw) = overlay.filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        if self.client_rules().is_none() {
            return Err(DatasetError::NoClientRules.into());
        }
        Ok(Some(ClientOverlay::parse(raw)?))
    }

    /// Declared type must match in the dataset or in the overlay
    fn check_type(&self, name: &str, overlay: Option<&str>, expected: TypeTag) -> Result<()> {
        let declared = self.attribute_type(name);
        if declared == Some(expected) {
            return Ok(());
        }

        let overlay = match overlay.filter(|s| !s.is_empty()) {
            Some(raw) => ClientOverlay::parse(raw)?,
            None => ClientOverlay::default(),
        };
        if overlay.declares(name, expected) {
            return Ok(());
        }
        if declared.is_none() && !overlay.contains(name) {
            // unknown everywhere, reported by the lookup itself
            return Ok(());
        }

        Err(UaprobeError::IncorrectType {
            name: name.to_string(),
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../tests/data/sample.json");

    const LINUX_UA: &str = "Mozilla/5.0 (Linux; Android 11.0)";
    const GALAXY_UA: &str =
        "Mozilla/5.0 (Linux; Android 11; SM-G991B) AppleWebKit/537.36 Chrome/96.0.4664.45 Mobile Safari/537.36";
    const IPHONE_UA: &str =
        "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Version/17.0 Mobile/15E148 Safari/604.1";
    const WINDOWS_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

    fn tree() -> CompiledTree {
        CompiledTree::from_slice(SAMPLE.as_bytes()).unwrap()
    }

    #[test]
    fn test_linux_scenario() {
        let props = tree().lookup(LINUX_UA, None, true).unwrap();
        assert_eq!(props.get("isMobile"), Some(&Value::Bool(true)));
        assert_eq!(props.get("osVersion"), Some(&Value::from("11.0")));
        assert_eq!(props.get("isTablet"), Some(&Value::Bool(false)));
        assert_eq!(props.matched(), "Mozilla/5.0 (Linux");
        assert_eq!(props.unmatched(), "; Android 11.0)");
    }

    #[test]
    fn test_untyped_keeps_raw_values() {
        let props = tree().lookup(LINUX_UA, None, false).unwrap();
        assert_eq!(props.get("isMobile"), Some(&Value::from("1")));
    }

    #[test]
    fn test_deeper_branch_and_refine() {
        let props = tree().lookup(GALAXY_UA, None, true).unwrap();
        assert_eq!(props.get("vendor"), Some(&Value::from("Samsung")));
        assert_eq!(props.get("model"), Some(&Value::from("Galaxy S21")));
        assert_eq!(props.get("yearReleased"), Some(&Value::Int(2021)));
        assert_eq!(props.get("releaseDate"), Some(&Value::from("2021-01-29")));
        assert_eq!(props.get("browserName"), Some(&Value::from("Chrome")));
        assert_eq!(props.get("browserVersion"), Some(&Value::from("96.0.4664.45")));
    }

    #[test]
    fn test_skip_attribute_disables_ua_rules() {
        let props = tree().lookup("Googlebot/2.1 Android 9.0", None, true).unwrap();
        assert_eq!(props.get("isRobot"), Some(&Value::Bool(true)));
        assert!(!props.contains("osVersion"));
    }

    #[test]
    fn test_no_match_is_root_only() {
        let props = tree().lookup("curl/8.4.0", None, true).unwrap();
        assert_eq!(props.get("isMobile"), Some(&Value::Bool(false)));
        assert_eq!(props.matched(), "");
        assert_eq!(props.unmatched(), "curl/8.4.0");
    }

    #[test]
    fn test_overlay_wins() {
        let props = tree().lookup(LINUX_UA, Some("bisTablet:1"), true).unwrap();
        assert_eq!(props.get("isTablet"), Some(&Value::Bool(true)));
        assert_eq!(props.get("isMobile"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_substitute_walk_keeps_detected_values() {
        let tree = tree();
        let plain = tree.lookup(IPHONE_UA, None, true).unwrap();
        let props = tree.lookup(IPHONE_UA, Some("bisTablet:1"), true).unwrap();

        // the iPad branch of the second walk does not replace what was found
        assert_eq!(props.get("model"), plain.get("model"));
        assert_eq!(props.get("model"), Some(&Value::from("iPhone")));
        assert_eq!(props.get("isMobile"), Some(&Value::Bool(true)));
        assert_eq!(props.get("isTablet"), Some(&Value::Bool(true)));
        assert_eq!(props.get("yearReleased"), Some(&Value::Int(2010)));
        assert_eq!(props.get("browserName"), Some(&Value::from("Safari")));
    }

    #[test]
    fn test_substitute_walk_fills_gaps() {
        let tree = tree();
        let plain = tree.lookup(WINDOWS_UA, None, true).unwrap();
        assert!(!plain.contains("model"));

        let props = tree
            .lookup(WINDOWS_UA, Some("bisTablet:1|svendor:Apple"), true)
            .unwrap();
        assert_eq!(props.get("model"), Some(&Value::from("iPad")));
        assert_eq!(props.get("isMobile"), plain.get("isMobile"));
        assert_eq!(props.get("vendor"), Some(&Value::from("Apple")));
        assert_eq!(props.get("yearReleased"), Some(&Value::Int(2010)));
    }

    #[test]
    fn test_integer_condition_override() {
        let props = tree()
            .lookup(LINUX_UA, Some("idisplayWidth:1200"), true)
            .unwrap();
        assert_eq!(props.get("displayWidth"), Some(&Value::Int(1200)));
        assert_eq!(props.get("deviceAspectRatio"), Some(&Value::from("16/10")));

        let props = tree().lookup(LINUX_UA, Some("idisplayWidth:800"), true).unwrap();
        assert!(!props.contains("deviceAspectRatio"));
    }

    #[test]
    fn test_bad_overlay_fails() {
        let err = tree().lookup(LINUX_UA, Some("qfoo:1"), true).unwrap_err();
        assert!(matches!(err, UaprobeError::ClientOverlay(_)));
    }

    #[test]
    fn test_overlay_without_client_rules() {
        let mut doc = crate::document::Document::from_slice(SAMPLE.as_bytes()).unwrap();
        doc.client_rules = None;
        let tree = CompiledTree::from_document(doc, true).unwrap();
        let err = tree.lookup(LINUX_UA, Some("bisTablet:1"), true).unwrap_err();
        assert!(matches!(err, UaprobeError::Dataset(DatasetError::NoClientRules)));
        assert!(tree.lookup(LINUX_UA, Some(""), true).is_ok());
    }

    #[test]
    fn test_single_agrees_with_bulk() {
        let tree = tree();
        for ua in [LINUX_UA, GALAXY_UA, IPHONE_UA, "Googlebot/2.1", "curl/8"] {
            let bulk = tree.lookup(ua, None, true).unwrap();
            for name in tree.list_attributes().keys() {
                match tree.lookup_single(ua, name, None) {
                    Ok(value) => assert_eq!(bulk.get(name), Some(&value), "{} {}", ua, name),
                    Err(UaprobeError::InvalidAttribute { .. }) => {
                        assert!(bulk.get(name).is_none(), "{} {}", ua, name)
                    }
                    Err(e) => panic!("unexpected error {}", e),
                }
            }
        }
    }

    #[test]
    fn test_single_with_overlay() {
        let tree = tree();
        let overlay = Some("bisTablet:1");
        assert!(tree.lookup_bool(LINUX_UA, "isTablet", overlay).unwrap());
        assert_eq!(tree.lookup_int(IPHONE_UA, "yearReleased", overlay).unwrap(), 2010);
        assert_eq!(tree.lookup_string(IPHONE_UA, "model", overlay).unwrap(), "iPhone");
        assert_eq!(
            tree.lookup_string(WINDOWS_UA, "model", Some("bisTablet:1|svendor:Apple"))
                .unwrap(),
            "iPad"
        );
        // overlay-only attribute
        assert_eq!(
            tree.lookup_single(LINUX_UA, "js.webGl", Some("bjs.webGl:1")).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_single_errors() {
        let tree = tree();
        assert!(matches!(
            tree.lookup_single(LINUX_UA, "noSuchThing", None),
            Err(UaprobeError::UnknownAttribute(name)) if name == "noSuchThing"
        ));
        assert!(matches!(
            tree.lookup_single(LINUX_UA, "model", None),
            Err(UaprobeError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_typed_accessors() {
        let tree = tree();
        assert!(tree.lookup_bool(LINUX_UA, "isMobile", None).unwrap());
        assert_eq!(tree.lookup_int(GALAXY_UA, "yearReleased", None).unwrap(), 2021);
        assert_eq!(tree.lookup_string(GALAXY_UA, "vendor", None).unwrap(), "Samsung");
        assert_eq!(tree.lookup_date(GALAXY_UA, "releaseDate", None).unwrap(), "2021-01-29");

        assert!(matches!(
            tree.lookup_int(GALAXY_UA, "vendor", None),
            Err(UaprobeError::IncorrectType { expected: TypeTag::Integer, .. })
        ));
        assert!(matches!(
            tree.lookup_bool(LINUX_UA, "js.webGl", Some("ijs.webGl:1")),
            Err(UaprobeError::IncorrectType { .. })
        ));
        assert!(matches!(
            tree.lookup_bool(LINUX_UA, "noSuchThing", None),
            Err(UaprobeError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let tree = tree();
        let a = tree.lookup(IPHONE_UA, Some("bisTablet:1"), true).unwrap();
        let b = tree.lookup(IPHONE_UA, Some("bisTablet:1"), true).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_input_is_trimmed() {
        let tree = tree();
        let a = tree.lookup(&format!("  {}\n", LINUX_UA), None, true).unwrap();
        let b = tree.lookup(LINUX_UA, None, true).unwrap();
        assert_eq!(a, b);
    }
}
