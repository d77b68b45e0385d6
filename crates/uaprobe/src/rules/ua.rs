//! Regex extraction of attributes from the identification string
//!
//! Some attributes (version numbers, build ids) are impractical to encode in
//! the trie. The UA rules pick rule lists either from the attributes the walk
//! found or by a regex search over the input, then run them against the
//! input.

use super::{compile_table, Condition, Rule, RuleGroup, RuleGroups, RuleSet};
use crate::dataset::CompiledTree;
use crate::document::UaRulesDoc;
use crate::error::DatasetError;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use uaprobe_value::{AttributeId, IdTable, Value, ValueId};

/// Requires the walk to have found `value` for `attribute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UaCondition {
    /// Attribute id
    pub attribute: AttributeId,
    /// Expected value id
    pub value: ValueId,
}

impl Condition for UaCondition {
    type Subject = FxHashMap<AttributeId, ValueId>;

    fn attribute(&self) -> AttributeId {
        self.attribute
    }

    fn holds(&self, found: &Self::Subject) -> bool {
        found.get(&self.attribute) == Some(&self.value)
    }
}

/// How a UA rule produces its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UaAction {
    /// A value from the value table
    Fixed(ValueId),
    /// A capture group of a regex run against the input
    Capture {
        /// Regex id
        regex: u32,
        /// Capture group index (0 is the whole match)
        group: usize,
    },
}

/// A UA rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UaRule {
    /// Attribute written
    pub attribute: AttributeId,
    /// Value source
    pub action: UaAction,
}

impl Rule for UaRule {
    fn attribute(&self) -> AttributeId {
        self.attribute
    }
}

/// Compiled UA rule section
#[derive(Debug, Clone)]
pub struct UaRules {
    groups: RuleGroups<UaCondition, UaRule>,
    skip: Vec<AttributeId>,
    regexes: IdTable<Regex>,
    required: FxHashSet<AttributeId>,
}

impl UaRules {
    /// Compile the `uar` section
    pub fn compile(doc: &UaRulesDoc) -> Result<Self, DatasetError> {
        let regexes = match doc.regex_table() {
            Some(table) => compile_table(table)?,
            None => IdTable::new(),
        };

        let mut groups = Vec::with_capacity(doc.groups.len());
        for group in &doc.groups {
            let conditions = group.matcher.as_ref().map(|matcher| {
                matcher
                    .iter()
                    .map(|(attribute, value)| UaCondition {
                        attribute,
                        value: *value,
                    })
                    .collect::<Vec<_>>()
            });

            let mut sets = Vec::with_capacity(group.sets.len());
            for set in &group.sets {
                let mut rules = Vec::with_capacity(set.rules.len());
                for rule in &set.rules {
                    let action = match (rule.value, rule.regex) {
                        (Some(value), _) => UaAction::Fixed(value),
                        (None, Some(regex)) => UaAction::Capture {
                            regex,
                            group: rule.group.unwrap_or(0),
                        },
                        (None, None) => {
                            return Err(DatasetError::BadData(format!(
                                "UA rule for attribute {} has neither a value nor a regex",
                                rule.attribute
                            )))
                        }
                    };
                    rules.push(UaRule {
                        attribute: rule.attribute,
                        action,
                    });
                }
                sets.push(RuleSet {
                    refine: set.refine,
                    search: set.search,
                    rules,
                });
            }

            groups.push(RuleGroup {
                conditions,
                sets,
                substitute: None,
            });
        }

        let groups = RuleGroups::new(groups);
        let mut required = groups.required().clone();
        // the skip check reads these too, so single lookups must collect them
        required.extend(doc.skip.iter().copied());

        Ok(Self {
            groups,
            skip: doc.skip.clone(),
            regexes,
            required,
        })
    }

    /// Whether some UA rule can produce `attribute`
    pub fn outputs(&self, attribute: AttributeId) -> bool {
        self.groups.outputs(attribute)
    }

    /// Attributes the rule selection reads from the walk
    pub fn required(&self) -> &FxHashSet<AttributeId> {
        &self.required
    }

    /// Compiled rule groups
    pub fn groups(&self) -> &RuleGroups<UaCondition, UaRule> {
        &self.groups
    }

    /// Compiled regex table
    pub fn regexes(&self) -> &IdTable<Regex> {
        &self.regexes
    }

    /// Run the rules for one input
    ///
    /// `found` is the raw walk result. When `wanted` is given, rules for
    /// other attributes are skipped. Returned values are typed when `typed`
    /// is set, otherwise raw (captures are strings).
    pub fn extract(
        &self,
        tree: &CompiledTree,
        found: &FxHashMap<AttributeId, ValueId>,
        input: &str,
        wanted: Option<&FxHashSet<AttributeId>>,
        typed: bool,
    ) -> Vec<(AttributeId, Value)> {
        if self.should_skip(tree, found) {
            return Vec::new();
        }

        let mut out = Vec::new();
        for rule in self.select(found, input) {
            if let Some(wanted) = wanted {
                if !wanted.contains(&rule.attribute) {
                    continue;
                }
            }

            match rule.action {
                UaAction::Fixed(value) => {
                    if let Some(v) = tree.value(rule.attribute, value, typed) {
                        out.push((rule.attribute, v));
                    }
                }
                UaAction::Capture { regex, group } => {
                    let Some(re) = self.regexes.get(regex) else {
                        continue;
                    };
                    let Some(caps) = re.captures(input) else {
                        continue;
                    };
                    let Some(m) = caps.get(group).filter(|m| !m.as_str().is_empty()) else {
                        continue;
                    };
                    let raw = Value::from(m.as_str());
                    let v = if typed {
                        tree.typed_value(rule.attribute, &raw)
                    } else {
                        raw
                    };
                    out.push((rule.attribute, v));
                }
            }
        }
        out
    }

    fn should_skip(&self, tree: &CompiledTree, found: &FxHashMap<AttributeId, ValueId>) -> bool {
        self.skip.iter().any(|attr| {
            found
                .get(attr)
                .and_then(|vid| tree.raw_value(*vid))
                .map_or(false, Value::cast_bool)
        })
    }

    fn select<'a>(&'a self, found: &FxHashMap<AttributeId, ValueId>, input: &str) -> Vec<&'a UaRule> {
        let mut rules: Vec<&UaRule> = Vec::new();

        for group in self.groups.matching(found) {
            let selected = if group.sets.len() > 1 {
                group.select(&self.regexes, input, |set| set.refine)
            } else {
                group.sets.first().map(|set| set.rules.as_slice())
            };
            if let Some(selected) = selected {
                rules.extend(selected);
            }
        }

        let searched = self
            .groups
            .groups()
            .iter()
            .find_map(|group| group.select(&self.regexes, input, |set| set.search));
        if let Some(searched) = searched {
            rules.extend(searched);
        }

        rules
    }
}
