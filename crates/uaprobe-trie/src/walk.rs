use crate::Node;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::borrow::Cow;
use uaprobe_value::{AttributeId, IdTable, ValueId};

/// Which attributes a walk should collect
#[derive(Debug, Clone, Copy)]
pub enum Wanted<'a> {
    /// Every attribute on the path; deeper nodes override shallower ones
    All,
    /// Only these attributes; the walk stops once each was seen non-volatile
    Only(&'a FxHashSet<AttributeId>),
}

/// Outcome of a walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Walk {
    /// Attributes collected along the path
    pub found: FxHashMap<AttributeId, ValueId>,
    /// Concatenation of every edge label taken
    pub matched: String,
    /// Remaining input (after normalization) when the walk stopped
    pub unmatched: String,
}

impl Node {
    /// Walk the trie with `input`
    ///
    /// `normalizers` is the regex table referenced by node rule ids; ids
    /// missing from the table are skipped. Each rule removes every match from
    /// the remaining input before the node's children are considered.
    ///
    /// At each node the shortest edge that prefixes the remaining input is
    /// taken. Prefix candidates that would split a UTF-8 sequence are skipped.
    pub fn walk(&self, normalizers: &IdTable<Regex>, input: &str, wanted: Wanted<'_>) -> Walk {
        let mut found = FxHashMap::default();
        let mut matched = String::new();
        let mut sought = match wanted {
            Wanted::All => None,
            Wanted::Only(set) => Some(set.clone()),
        };
        let mut rest: Cow<'_, str> = Cow::Borrowed(input);
        let mut node = self;

        loop {
            match sought.as_mut() {
                None => {
                    found.extend(node.values.iter().map(|(k, v)| (*k, *v)));
                }
                Some(sought) => {
                    if sought.is_empty() {
                        break;
                    }
                    for (attr, value) in &node.values {
                        if sought.contains(attr) {
                            found.insert(*attr, *value);
                            if !node.volatile.contains_key(attr) {
                                sought.remove(attr);
                            }
                        }
                    }
                    if sought.is_empty() {
                        break;
                    }
                }
            }

            if node.is_leaf() {
                break;
            }

            for rule in &node.rules {
                if let Some(re) = normalizers.get(*rule) {
                    let replaced = match re.replace_all(&rest, "") {
                        Cow::Owned(s) => Some(s),
                        Cow::Borrowed(_) => None,
                    };
                    if let Some(s) = replaced {
                        rest = Cow::Owned(s);
                    }
                }
            }

            let Some((len, child)) = shortest_edge(node, &rest) else {
                break;
            };
            matched.push_str(&rest[..len]);
            rest = match rest {
                Cow::Borrowed(s) => Cow::Borrowed(&s[len..]),
                Cow::Owned(s) => Cow::Owned(s[len..].to_string()),
            };
            node = child;
        }

        Walk {
            found,
            matched,
            unmatched: rest.into_owned(),
        }
    }
}

fn shortest_edge<'n>(node: &'n Node, rest: &str) -> Option<(usize, &'n Node)> {
    let limit = node.longest_edge().min(rest.len());
    (1..=limit).find_map(|len| {
        let prefix = rest.get(..len)?;
        node.child(prefix).map(|child| (len, child))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_rules() -> IdTable<Regex> {
        IdTable::new()
    }

    fn sample() -> Node {
        // 1: isBrowser, 2: isMobile, 3: vendor, 4: model
        Node::new().with_volatile(1, 0).with_child(
            "Mozilla/5.0 (",
            Node::new()
                .with_value(1, 1)
                .with_volatile(2, 0)
                .with_child(
                    "Linux",
                    Node::new().with_value(2, 1).with_child("; Android", Node::new().with_value(4, 7)),
                )
                .with_child("iPhone", Node::new().with_value(3, 5).with_value(2, 1)),
        )
    }

    #[test]
    fn test_want_all_deeper_overrides() {
        let walk = sample().walk(&no_rules(), "Mozilla/5.0 (Linux; Android 14)", Wanted::All);
        assert_eq!(walk.found.get(&1), Some(&1));
        assert_eq!(walk.found.get(&2), Some(&1));
        assert_eq!(walk.found.get(&4), Some(&7));
        assert_eq!(walk.matched, "Mozilla/5.0 (Linux; Android");
        assert_eq!(walk.unmatched, " 14)");
    }

    #[test]
    fn test_sought_volatile_keeps_walking() {
        let wanted: FxHashSet<_> = [2].into_iter().collect();
        let walk = sample().walk(&no_rules(), "Mozilla/5.0 (iPhone; CPU)", Wanted::Only(&wanted));
        assert_eq!(walk.found.get(&2), Some(&1));
        assert_eq!(walk.found.len(), 1);
        assert_eq!(walk.matched, "Mozilla/5.0 (iPhone");
    }

    #[test]
    fn test_sought_stops_early() {
        let wanted: FxHashSet<_> = [1].into_iter().collect();
        let walk = sample().walk(&no_rules(), "Mozilla/5.0 (iPhone; CPU)", Wanted::Only(&wanted));
        assert_eq!(walk.found.get(&1), Some(&1));
        assert_eq!(walk.matched, "Mozilla/5.0 (");
        assert_eq!(walk.unmatched, "iPhone; CPU)");
    }

    #[test]
    fn test_shortest_edge_wins() {
        let root = Node::new()
            .with_child("ab", Node::new().with_value(1, 1))
            .with_child("abc", Node::new().with_value(1, 2));
        let walk = root.walk(&no_rules(), "abcd", Wanted::All);
        assert_eq!(walk.found.get(&1), Some(&1));
        assert_eq!(walk.matched, "ab");
    }

    #[test]
    fn test_normalization_rules() {
        let mut rules = IdTable::new();
        rules.insert(0, Regex::new(r"\s*\[FB[^\]]*\]").unwrap());
        let root = Node::new()
            .with_rules(vec![0, 9])
            .with_child("Opera Mini", Node::new().with_value(1, 3));
        let walk = root.walk(&rules, "Opera [FBAN/x] Mini/8", Wanted::All);
        assert_eq!(walk.found.get(&1), Some(&3));
        assert_eq!(walk.matched, "Opera Mini");
        assert_eq!(walk.unmatched, "/8");

        let walk = root.walk(&no_rules(), "Opera [FBAN/x] Mini/8", Wanted::All);
        assert_eq!(walk.found.get(&1), None);
    }

    #[test]
    fn test_no_match_returns_root_values() {
        let walk = sample().walk(&no_rules(), "curl/8.0", Wanted::All);
        assert_eq!(walk.found.get(&1), Some(&0));
        assert!(walk.matched.is_empty());
        assert_eq!(walk.unmatched, "curl/8.0");

        let walk = sample().walk(&no_rules(), "", Wanted::All);
        assert_eq!(walk.found.len(), 1);
    }

    #[test]
    fn test_multibyte_input() {
        let root = Node::new().with_child("é", Node::new().with_value(1, 1)).with_child("éa", Node::new());
        let walk = root.walk(&no_rules(), "éé", Wanted::All);
        assert_eq!(walk.found.get(&1), Some(&1));
        assert_eq!(walk.unmatched, "é");

        let walk = sample().walk(&no_rules(), "Mozilla/5.0 (日本", Wanted::All);
        assert_eq!(walk.unmatched, "日本");
    }
}
