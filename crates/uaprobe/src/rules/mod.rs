//! Post-walk rule engines
//!
//! Both engines that run after the trie walk share one shape: an ordered list
//! of groups, each guarded by a conjunction of conditions over what is known
//! so far, each carrying one or more rule lists. [`RuleGroups`] evaluates that
//! shape generically; [`ua`] and [`client`] supply the condition and rule
//! types.

use crate::error::DatasetError;
use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashSet;
use uaprobe_value::{AttributeId, IdTable};

pub mod client;
pub mod ua;

pub use client::{ClientCondition, ClientRule, ClientRules, Operator};
pub use ua::{UaAction, UaCondition, UaRule, UaRules};

/// A predicate over the attributes known before a group is selected
pub trait Condition {
    /// What the condition is evaluated against
    type Subject: ?Sized;

    /// Attribute the condition reads
    fn attribute(&self) -> AttributeId;

    /// Evaluate the condition
    fn holds(&self, subject: &Self::Subject) -> bool;
}

/// A rule that produces one attribute
pub trait Rule {
    /// Attribute the rule writes
    fn attribute(&self) -> AttributeId;
}

/// A rule list together with the regexes that can select it
#[derive(Debug, Clone)]
pub struct RuleSet<R> {
    /// Selects this list after the group's conditions held
    pub refine: Option<u32>,
    /// Selects this list when scanning without conditions
    pub search: Option<u32>,
    /// Rules, in application order
    pub rules: Vec<R>,
}

/// A guarded group of rule lists
#[derive(Debug, Clone)]
pub struct RuleGroup<C, R> {
    /// Conditions that must all hold; `None` means the group can only be
    /// reached by a regex search
    pub conditions: Option<Vec<C>>,
    /// Candidate rule lists
    pub sets: Vec<RuleSet<R>>,
    /// Substitute identification string walked when the group is selected
    pub substitute: Option<String>,
}

impl<C: Condition, R> RuleGroup<C, R> {
    /// Whether every condition holds (short-circuits on the first failure)
    pub fn matches(&self, subject: &C::Subject) -> bool {
        match &self.conditions {
            Some(conditions) => conditions.iter().all(|c| c.holds(subject)),
            None => false,
        }
    }

    /// Rules of the first set whose `pick` regex matches `input`
    pub fn select<'a>(
        &'a self,
        regexes: &IdTable<Regex>,
        input: &str,
        pick: impl Fn(&RuleSet<R>) -> Option<u32>,
    ) -> Option<&'a [R]> {
        self.sets.iter().find_map(|set| {
            let id = pick(set)?;
            let re = regexes.get(id)?;
            re.is_match(input).then_some(set.rules.as_slice())
        })
    }
}

/// Ordered rule groups plus the attribute sets they read and write
#[derive(Debug, Clone)]
pub struct RuleGroups<C, R> {
    groups: Vec<RuleGroup<C, R>>,
    outputs: FxHashSet<AttributeId>,
    required: FxHashSet<AttributeId>,
}

impl<C: Condition, R: Rule> RuleGroups<C, R> {
    /// Index a list of groups
    pub fn new(groups: Vec<RuleGroup<C, R>>) -> Self {
        let mut outputs = FxHashSet::default();
        let mut required = FxHashSet::default();
        for group in &groups {
            for condition in group.conditions.iter().flatten() {
                required.insert(condition.attribute());
            }
            for set in &group.sets {
                outputs.extend(set.rules.iter().map(Rule::attribute));
            }
        }
        Self {
            groups,
            outputs,
            required,
        }
    }

    /// Groups in evaluation order
    pub fn groups(&self) -> &[RuleGroup<C, R>] {
        &self.groups
    }

    /// Whether some rule can write `attribute`
    pub fn outputs(&self, attribute: AttributeId) -> bool {
        self.outputs.contains(&attribute)
    }

    /// Attributes some condition reads
    pub fn required(&self) -> &FxHashSet<AttributeId> {
        &self.required
    }

    /// Groups whose conditions hold, in order
    pub fn matching<'a, 's>(
        &'a self,
        subject: &'s C::Subject,
    ) -> impl Iterator<Item = &'a RuleGroup<C, R>> + 's
    where
        'a: 's,
    {
        self.groups.iter().filter(move |g| g.matches(subject))
    }

    /// First group whose conditions hold
    pub fn first_matching(&self, subject: &C::Subject) -> Option<&RuleGroup<C, R>> {
        self.groups.iter().find(|g| g.matches(subject))
    }

    /// Number of groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Compile a pattern written either bare or as `/pattern/flags`
///
/// Supported flags are `i`, `m`, `s`, `x` and `U`; `u` is accepted and
/// ignored since patterns are always Unicode-aware. Other flag letters are
/// ignored as well.
pub fn compile_pattern(id: u32, pattern: &str) -> Result<Regex, DatasetError> {
    let (body, flags) = split_delimited(pattern).unwrap_or((pattern, ""));
    let mut builder = RegexBuilder::new(body);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'U' => builder.swap_greed(true),
            _ => &mut builder,
        };
    }
    builder.build().map_err(|source| DatasetError::InvalidRegex {
        id,
        pattern: pattern.to_string(),
        source,
    })
}

/// Compile a whole pattern table
pub fn compile_table(table: &IdTable<String>) -> Result<IdTable<Regex>, DatasetError> {
    table.try_map(|id, pattern| compile_pattern(id, pattern))
}

fn split_delimited(pattern: &str) -> Option<(&str, &str)> {
    let rest = pattern.strip_prefix('/')?;
    let end = rest.rfind('/')?;
    let flags = &rest[end + 1..];
    if flags.chars().all(|c| c.is_ascii_alphabetic()) {
        Some((&rest[..end], flags))
    } else {
        None
    }
}
