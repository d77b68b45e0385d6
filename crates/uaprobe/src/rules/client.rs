//! Client property rules
//!
//! After a client overlay has been merged over the walk result, the first
//! group whose conditions hold may request a second walk with a substitute
//! identification string and then force a few attribute values.

use super::{Condition, Rule, RuleGroup, RuleGroups, RuleSet};
use crate::dataset::{Attribute, CompiledTree};
use crate::document::ClientRulesDoc;
use crate::error::DatasetError;
use crate::lookup::Properties;
use crate::overlay::ClientOverlay;
use rustc_hash::FxHashSet;
use std::fmt;
use std::str::FromStr;
use uaprobe_value::{AttributeId, IdTable, TypeTag, Value, ValueId};

/// Comparison operator of a client rule condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl Operator {
    /// Apply the operator to two ordered operands
    pub fn compare<T: Ord>(self, detected: T, expected: T) -> bool {
        match self {
            Operator::Eq => detected == expected,
            Operator::Ne => detected != expected,
            Operator::Lt => detected < expected,
            Operator::Le => detected <= expected,
            Operator::Gt => detected > expected,
            Operator::Ge => detected >= expected,
        }
    }

    /// Wire symbol
    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        }
    }
}

impl FromStr for Operator {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            other => Err(DatasetError::BadData(format!(
                "unknown client rule operator {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Compares a merged attribute against a typed expected value
///
/// String and boolean attributes support only `=` and `!=`; integer
/// attributes support all six operators. Date and unknown attributes never
/// match.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCondition {
    /// Attribute id
    pub attribute: AttributeId,
    /// Attribute name, the key in the merged set
    pub name: String,
    /// Declared type of the attribute
    pub tag: TypeTag,
    /// Operator
    pub operator: Operator,
    /// Expected value, already typed
    pub expected: Value,
}

impl Condition for ClientCondition {
    type Subject = Properties;

    fn attribute(&self) -> AttributeId {
        self.attribute
    }

    fn holds(&self, merged: &Properties) -> bool {
        let Some(detected) = merged.get(&self.name) else {
            return false;
        };
        let detected = detected.typed(self.tag);

        match self.tag {
            TypeTag::String | TypeTag::Boolean => match self.operator {
                Operator::Eq => detected == self.expected,
                Operator::Ne => detected != self.expected,
                _ => false,
            },
            TypeTag::Integer => self
                .operator
                .compare(detected.cast_int(), self.expected.cast_int()),
            TypeTag::Date | TypeTag::Unknown => false,
        }
    }
}

/// Forces `value` for `attribute`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRule {
    /// Attribute id
    pub attribute: AttributeId,
    /// Value id
    pub value: ValueId,
}

impl Rule for ClientRule {
    fn attribute(&self) -> AttributeId {
        self.attribute
    }
}

/// Compiled client rule section
#[derive(Debug, Clone)]
pub struct ClientRules {
    groups: RuleGroups<ClientCondition, ClientRule>,
}

impl ClientRules {
    /// Compile the `cpr` section against the attribute and value tables
    pub fn compile(
        doc: &ClientRulesDoc,
        attributes: &IdTable<Attribute>,
        values: &IdTable<Value>,
    ) -> Result<Self, DatasetError> {
        let mut groups = Vec::with_capacity(doc.groups.len());

        for group in &doc.groups {
            let mut conditions = Vec::with_capacity(group.matchers.len());
            for matcher in &group.matchers {
                let attribute = attributes.get(matcher.attribute).ok_or_else(|| {
                    DatasetError::BadData(format!(
                        "client rule refers to unknown attribute {}",
                        matcher.attribute
                    ))
                })?;
                let raw = values.get(matcher.value).ok_or_else(|| {
                    DatasetError::BadData(format!(
                        "client rule refers to unknown value {}",
                        matcher.value
                    ))
                })?;
                conditions.push(ClientCondition {
                    attribute: matcher.attribute,
                    name: attribute.name.clone(),
                    tag: attribute.tag,
                    operator: matcher.operator.parse()?,
                    expected: raw.typed(attribute.tag),
                });
            }

            let rules = group
                .rules
                .iter()
                .map(|r| ClientRule {
                    attribute: r.attribute,
                    value: r.value,
                })
                .collect();

            groups.push(RuleGroup {
                conditions: Some(conditions),
                sets: vec![RuleSet {
                    refine: None,
                    search: None,
                    rules,
                }],
                substitute: group.substitute.clone(),
            });
        }

        Ok(Self {
            groups: RuleGroups::new(groups),
        })
    }

    /// Whether some override can produce `attribute`
    pub fn outputs(&self, attribute: AttributeId) -> bool {
        self.groups.outputs(attribute)
    }

    /// Attributes the conditions read
    pub fn required(&self) -> &FxHashSet<AttributeId> {
        self.groups.required()
    }

    /// Compiled rule groups
    pub fn groups(&self) -> &RuleGroups<ClientCondition, ClientRule> {
        &self.groups
    }

    /// Merge `overlay` into `detected` and run the first matching group
    ///
    /// Priority, highest first: group overrides, overlay values, whatever
    /// `detected` already held, second walk.
    pub fn apply(
        &self,
        tree: &CompiledTree,
        detected: &mut Properties,
        overlay: &ClientOverlay,
        typed: bool,
    ) {
        overlay.merge_into(detected, typed);

        let Some(group) = self.groups.first_matching(detected) else {
            return;
        };

        if let Some(substitute) = group.substitute.as_deref() {
            let second = tree.substitute_properties(substitute, typed);
            detected.fill_missing(second);
            overlay.merge_into(detected, typed);
        }

        for rule in group.sets.iter().flat_map(|set| set.rules.iter()) {
            let name = tree.attribute_name(rule.attribute);
            let value = tree.value(rule.attribute, rule.value, typed);
            if let (Some(name), Some(value)) = (name, value) {
                detected.insert(name, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(tag: TypeTag, operator: Operator, expected: Value) -> ClientCondition {
        ClientCondition {
            attribute: 0,
            name: "attr".to_string(),
            tag,
            operator,
            expected,
        }
    }

    fn props(value: Value) -> Properties {
        let mut p = Properties::default();
        p.insert("attr", value);
        p
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!("<=".parse::<Operator>().unwrap(), Operator::Le);
        assert_eq!("!=".parse::<Operator>().unwrap(), Operator::Ne);
        assert!("~".parse::<Operator>().is_err());
        assert_eq!(Operator::Ge.to_string(), ">=");
    }

    #[test]
    fn test_integer_comparisons() {
        let subject = props(Value::from("16/10"));
        assert!(condition(TypeTag::Integer, Operator::Eq, Value::Int(16)).holds(&subject));
        assert!(condition(TypeTag::Integer, Operator::Ge, Value::Int(16)).holds(&subject));
        assert!(condition(TypeTag::Integer, Operator::Lt, Value::Int(17)).holds(&subject));
        assert!(!condition(TypeTag::Integer, Operator::Gt, Value::Int(16)).holds(&subject));
        assert!(condition(TypeTag::Integer, Operator::Ne, Value::Int(3)).holds(&subject));
    }

    #[test]
    fn test_boolean_only_equality() {
        let subject = props(Value::Int(1));
        assert!(condition(TypeTag::Boolean, Operator::Eq, Value::Bool(true)).holds(&subject));
        assert!(!condition(TypeTag::Boolean, Operator::Ne, Value::Bool(true)).holds(&subject));
        assert!(!condition(TypeTag::Boolean, Operator::Ge, Value::Bool(true)).holds(&subject));
    }

    #[test]
    fn test_string_and_missing() {
        let subject = props(Value::from("Android"));
        assert!(condition(TypeTag::String, Operator::Eq, Value::from("Android")).holds(&subject));
        assert!(!condition(TypeTag::String, Operator::Lt, Value::from("Z")).holds(&subject));
        assert!(!condition(TypeTag::Date, Operator::Eq, Value::from("Android")).holds(&subject));

        let empty = Properties::default();
        assert!(!condition(TypeTag::String, Operator::Ne, Value::from("x")).holds(&empty));
    }
}
