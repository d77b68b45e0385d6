//! Scalar values, type tags and id tables for uaprobe datasets.
//!
//! A compiled dataset stores every attribute value once, in a value table
//! indexed by value id, and every attribute name once, prefixed with a single
//! character that declares its type (`b`, `i`, `s`, `d` or `u`). This crate
//! holds the shared vocabulary for both tables:
//!
//! - [`Value`]: an untyped scalar as stored in the dataset, and also the
//!   result of typed conversion
//! - [`TypeTag`]: the declared type of an attribute
//! - [`IdTable`]: a dense id-indexed table that reads both the array and the
//!   object wire forms

#![warn(missing_docs)]

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

mod cast;

/// Numeric id of an attribute in the dataset's attribute table
pub type AttributeId = u32;

/// Numeric id of a value in the dataset's value table
pub type ValueId = u32;

/// A scalar attribute value
///
/// Raw values come straight from the dataset's value table (or from a regex
/// capture) and keep whatever JSON shape the generator gave them. Typed values
/// are produced by [`Value::typed`] and are always `Bool`, `Int` or `String`
/// (or the raw value itself for [`TypeTag::Unknown`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
}

impl Value {
    /// Convert this raw value to the representation declared by `tag`
    ///
    /// Booleans stored as strings are true only for `"1"` and for `"true"` in
    /// any letter case; every other scalar goes through the regular casts.
    pub fn typed(&self, tag: TypeTag) -> Value {
        match tag {
            TypeTag::Boolean => match self {
                Value::String(s) => Value::Bool(s == "1" || s.eq_ignore_ascii_case("true")),
                other => Value::Bool(other.cast_bool()),
            },
            TypeTag::Integer => Value::Int(self.cast_int()),
            TypeTag::String | TypeTag::Date => Value::String(self.cast_string()),
            TypeTag::Unknown => self.clone(),
        }
    }

    /// Scalar-to-boolean cast (`0`, `""`, `"0"` and null are false)
    pub fn cast_bool(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !(s.is_empty() || s == "0"),
        }
    }

    /// Scalar-to-integer cast
    ///
    /// Strings contribute their leading decimal integer (`"16/10"` is 16,
    /// `"abc"` is 0); floats truncate toward zero.
    pub fn cast_int(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Bool(b) => i64::from(*b),
            Value::Int(i) => *i,
            Value::Float(f) => cast::float_to_int(*f),
            Value::String(s) => cast::leading_int(s),
        }
    }

    /// Scalar-to-string cast (`true` is `"1"`, `false` and null are empty)
    pub fn cast_string(&self) -> String {
        match self {
            Value::Null | Value::Bool(false) => String::new(),
            Value::Bool(true) => "1".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => cast::float_to_string(*f),
            Value::String(s) => s.clone(),
        }
    }

    /// Borrow the string content, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Return the boolean, if this is a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Return the integer, if this is an integer value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Declared type of a dataset attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    /// `s` prefix
    String,
    /// `b` prefix
    Boolean,
    /// `i` prefix
    Integer,
    /// `d` prefix; dates are carried as strings
    Date,
    /// `u` prefix, or any prefix this library does not know
    Unknown,
}

impl TypeTag {
    /// Map a name prefix character to its tag
    pub fn from_prefix(c: char) -> TypeTag {
        match c {
            's' => TypeTag::String,
            'b' => TypeTag::Boolean,
            'i' => TypeTag::Integer,
            'd' => TypeTag::Date,
            _ => TypeTag::Unknown,
        }
    }

    /// The name prefix character for this tag
    pub fn prefix(self) -> char {
        match self {
            TypeTag::String => 's',
            TypeTag::Boolean => 'b',
            TypeTag::Integer => 'i',
            TypeTag::Date => 'd',
            TypeTag::Unknown => 'u',
        }
    }

    /// Human readable type name
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::String => "string",
            TypeTag::Boolean => "boolean",
            TypeTag::Integer => "integer",
            TypeTag::Date => "date",
            TypeTag::Unknown => "unknown",
        }
    }

    /// Split a type-prefixed attribute name (`"bisMobile"`) into its tag and bare name
    ///
    /// Returns `None` for an empty string.
    pub fn split_prefixed(prefixed: &str) -> Option<(TypeTag, &str)> {
        let mut chars = prefixed.chars();
        let first = chars.next()?;
        Some((TypeTag::from_prefix(first), chars.as_str()))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Id-indexed table with optional holes
///
/// The dataset generator writes id tables either as a JSON array (index is
/// the id) or as an object keyed by decimal ids. Both forms deserialize into
/// the same dense representation. Serialization writes an array when there
/// are no holes and an object otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct IdTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<T> IdTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the entry for `id`
    #[inline]
    pub fn get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// Whether an entry exists for `id`
    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Set the entry for `id`, growing the table as needed
    pub fn insert(&mut self, id: u32, value: T) {
        let idx = id as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(value);
    }

    /// Append an entry and return its id
    pub fn push(&mut self, value: T) -> u32 {
        self.slots.push(Some(value));
        (self.slots.len() - 1) as u32
    }

    /// Number of populated entries
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the table has no populated entries
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Iterate populated entries in id order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u32, v)))
    }

    /// Map every entry, keeping ids
    pub fn try_map<U, E>(&self, mut f: impl FnMut(u32, &T) -> Result<U, E>) -> Result<IdTable<U>, E> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            slots.push(match slot {
                Some(v) => Some(f(i as u32, v)?),
                None => None,
            });
        }
        Ok(IdTable { slots })
    }
}

impl<T> FromIterator<T> for IdTable<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().map(Some).collect(),
        }
    }
}

impl<T: Serialize> Serialize for IdTable<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.slots.iter().all(Option::is_some) {
            let mut seq = serializer.serialize_seq(Some(self.slots.len()))?;
            for v in self.slots.iter().flatten() {
                seq.serialize_element(v)?;
            }
            seq.end()
        } else {
            let mut map = serializer.serialize_map(Some(self.len()))?;
            for (id, v) in self.iter() {
                map.serialize_entry(&id.to_string(), v)?;
            }
            map.end()
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for IdTable<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TableVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for TableVisitor<T> {
            type Value = IdTable<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an array or an object keyed by numeric ids")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut slots = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(v) = seq.next_element::<T>()? {
                    slots.push(Some(v));
                }
                Ok(IdTable { slots })
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut table = IdTable::new();
                while let Some(key) = map.next_key::<String>()? {
                    let id: u32 = key
                        .parse()
                        .map_err(|_| de::Error::custom(format!("invalid table id {:?}", key)))?;
                    table.insert(id, map.next_value::<T>()?);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_any(TableVisitor(PhantomData))
    }
}
