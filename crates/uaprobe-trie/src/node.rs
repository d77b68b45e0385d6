use rustc_hash::FxHashMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use uaprobe_value::{AttributeId, ValueId};

/// A trie node
///
/// Wire tags: `d` values, `m` volatile, `c` children, `r` normalization
/// rule ids. The node owns its children; there are no back edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "NodeRepr")]
pub struct Node {
    /// Attributes finalized at this node
    #[serde(rename = "d", skip_serializing_if = "FxHashMap::is_empty")]
    pub values: FxHashMap<AttributeId, ValueId>,

    /// Attributes at this node that a deeper node may override
    #[serde(rename = "m", skip_serializing_if = "FxHashMap::is_empty")]
    pub volatile: FxHashMap<AttributeId, ValueId>,

    #[serde(rename = "c", skip_serializing_if = "FxHashMap::is_empty")]
    children: FxHashMap<String, Node>,

    /// Normalization rule ids applied to the remaining input before children are matched
    #[serde(rename = "r", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<u32>,

    /// Byte length of the longest child edge, bounds the prefix scan
    #[serde(skip)]
    longest_edge: usize,
}

impl Node {
    /// Create an empty node
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value on this node
    pub fn with_value(mut self, attr: AttributeId, value: ValueId) -> Self {
        self.values.insert(attr, value);
        self
    }

    /// Set an attribute value and mark it volatile
    pub fn with_volatile(mut self, attr: AttributeId, value: ValueId) -> Self {
        self.values.insert(attr, value);
        self.volatile.insert(attr, value);
        self
    }

    /// Attach a child under `edge`
    pub fn with_child(mut self, edge: impl Into<String>, child: Node) -> Self {
        self.insert_child(edge, child);
        self
    }

    /// Attach normalization rules
    pub fn with_rules(mut self, rules: Vec<u32>) -> Self {
        self.rules = rules;
        self
    }

    /// Child edges of this node
    pub fn children(&self) -> &FxHashMap<String, Node> {
        &self.children
    }

    /// Child reached through exactly `edge`
    pub fn child(&self, edge: &str) -> Option<&Node> {
        self.children.get(edge)
    }

    /// Mutable child reached through exactly `edge`
    pub fn child_mut(&mut self, edge: &str) -> Option<&mut Node> {
        self.children.get_mut(edge)
    }

    /// Mutable iteration over children (edges cannot be changed)
    pub fn children_mut(&mut self) -> impl Iterator<Item = (&String, &mut Node)> {
        self.children.iter_mut()
    }

    /// Insert or replace a child, returning the previous one
    ///
    /// Empty edges are ignored; they could never be matched.
    pub fn insert_child(&mut self, edge: impl Into<String>, child: Node) -> Option<Node> {
        let edge = edge.into();
        if edge.is_empty() {
            return None;
        }
        self.longest_edge = self.longest_edge.max(edge.len());
        self.children.insert(edge, child)
    }

    /// Detach a child
    pub fn remove_child(&mut self, edge: &str) -> Option<Node> {
        let removed = self.children.remove(edge);
        if removed.is_some() {
            self.reindex();
        }
        removed
    }

    /// Keep only children for which `keep` returns true
    pub fn retain_children(&mut self, mut keep: impl FnMut(&str, &Node) -> bool) {
        self.children.retain(|edge, child| keep(edge, child));
        self.reindex();
    }

    /// Whether this node has any children
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Byte length of the longest child edge (0 for leaves)
    pub fn longest_edge(&self) -> usize {
        self.longest_edge
    }

    /// Total number of nodes in this subtree, including this one
    pub fn node_count(&self) -> usize {
        1 + self.children.values().map(Node::node_count).sum::<usize>()
    }

    /// Visit every node of the subtree, depth first, with its path of edges
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&[&'a str], &'a Node)) {
        let mut path = Vec::new();
        self.visit_inner(&mut path, f);
    }

    fn visit_inner<'a>(&'a self, path: &mut Vec<&'a str>, f: &mut impl FnMut(&[&'a str], &'a Node)) {
        f(path, self);
        for (edge, child) in &self.children {
            path.push(edge);
            child.visit_inner(path, f);
            path.pop();
        }
    }

    /// Visit every node mutably, depth first
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for child in self.children.values_mut() {
            child.visit_mut(f);
        }
    }

    fn reindex(&mut self) {
        self.longest_edge = self.children.keys().map(String::len).max().unwrap_or(0);
    }
}

/// Wire shape of a node, before derived fields are computed
#[derive(Deserialize)]
struct NodeRepr {
    #[serde(rename = "d", default, deserialize_with = "indexed_map")]
    values: FxHashMap<AttributeId, ValueId>,
    #[serde(rename = "m", default, deserialize_with = "indexed_map")]
    volatile: FxHashMap<AttributeId, ValueId>,
    #[serde(rename = "c", default, deserialize_with = "indexed_map")]
    children: FxHashMap<String, Node>,
    #[serde(rename = "r", default)]
    rules: Vec<u32>,
}

impl From<NodeRepr> for Node {
    fn from(repr: NodeRepr) -> Self {
        let mut node = Node {
            values: repr.values,
            volatile: repr.volatile,
            children: repr.children,
            rules: repr.rules,
            longest_edge: 0,
        };
        node.children.retain(|edge, _| !edge.is_empty());
        node.reindex();
        node
    }
}

/// Keys that can appear in an object-or-array keyed wire map
trait IndexKey: Sized + Eq + Hash {
    fn from_index(index: usize) -> Option<Self>;
    fn parse_key(key: &str) -> Option<Self>;
}

impl IndexKey for u32 {
    fn from_index(index: usize) -> Option<Self> {
        u32::try_from(index).ok()
    }

    fn parse_key(key: &str) -> Option<Self> {
        key.parse().ok()
    }
}

impl IndexKey for String {
    fn from_index(index: usize) -> Option<Self> {
        Some(index.to_string())
    }

    fn parse_key(key: &str) -> Option<Self> {
        Some(key.to_string())
    }
}

// Generators that emit sequentially keyed maps as JSON arrays are common,
// so both forms are accepted. Nulls in the array form are holes.
fn indexed_map<'de, D, K, V>(deserializer: D) -> Result<FxHashMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: IndexKey,
    V: Deserialize<'de>,
{
    struct MapVisitor<K, V>(PhantomData<(K, V)>);

    impl<'de, K: IndexKey, V: Deserialize<'de>> Visitor<'de> for MapVisitor<K, V> {
        type Value = FxHashMap<K, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an object or an array")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut out = FxHashMap::default();
            while let Some(key) = map.next_key::<String>()? {
                let k = K::parse_key(&key)
                    .ok_or_else(|| de::Error::custom(format!("invalid key {:?}", key)))?;
                out.insert(k, map.next_value::<V>()?);
            }
            Ok(out)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = FxHashMap::default();
            let mut index = 0usize;
            while let Some(v) = seq.next_element::<Option<V>>()? {
                if let Some(v) = v {
                    let k = K::from_index(index)
                        .ok_or_else(|| de::Error::custom("array index out of range"))?;
                    out.insert(k, v);
                }
                index += 1;
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(MapVisitor(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_short_tags() {
        let json = r#"{
            "d": {"3": 7},
            "m": {"3": 7},
            "c": {"Mozilla": {"d": {"4": 1}}, "Opera": {}},
            "r": [0, 2]
        }"#;
        let node: Node = serde_json::from_str(json).unwrap();
        assert_eq!(node.values.get(&3), Some(&7));
        assert!(node.volatile.contains_key(&3));
        assert_eq!(node.rules, vec![0, 2]);
        assert_eq!(node.longest_edge(), "Mozilla".len());
        assert_eq!(node.child("Mozilla").unwrap().values.get(&4), Some(&1));
        assert_eq!(node.node_count(), 3);
    }

    #[test]
    fn test_deserialize_array_forms() {
        let node: Node = serde_json::from_str(r#"{"d": [5, null, 9]}"#).unwrap();
        assert_eq!(node.values.get(&0), Some(&5));
        assert_eq!(node.values.get(&1), None);
        assert_eq!(node.values.get(&2), Some(&9));

        let empty: Node = serde_json::from_str(r#"{"d": [], "c": []}"#).unwrap();
        assert!(empty.values.is_empty());
        assert!(empty.is_leaf());
    }

    #[test]
    fn test_serialize_skips_empty_fields() {
        let node = Node::new().with_value(1, 2);
        let json = serde_json::to_string(&node).unwrap();
        assert_eq!(json, r#"{"d":{"1":2}}"#);
    }

    #[test]
    fn test_longest_edge_tracks_mutation() {
        let mut node = Node::new()
            .with_child("ab", Node::new())
            .with_child("abcdef", Node::new());
        assert_eq!(node.longest_edge(), 6);

        node.remove_child("abcdef");
        assert_eq!(node.longest_edge(), 2);

        node.retain_children(|_, _| false);
        assert_eq!(node.longest_edge(), 0);
        assert!(node.insert_child("", Node::new()).is_none());
        assert!(node.is_leaf());
    }

    #[test]
    fn test_visit_paths() {
        let node = Node::new().with_child("a", Node::new().with_child("b", Node::new()));
        let mut paths = Vec::new();
        node.visit(&mut |path, _| paths.push(path.concat()));
        paths.sort();
        assert_eq!(paths, vec!["", "a", "ab"]);
    }
}
