//! Radix trie walker for compiled identification trees
//!
//! The reference tree is a radix trie whose edges are strings of varying
//! length. Each node finalizes a set of attributes (attribute id → value id),
//! may mark some of them as *volatile* (a deeper node can still override
//! them), and may carry normalization rules that strip substrings from the
//! remaining input before its children are matched.
//!
//! ```text
//!   root ──"Mozilla/5.0 ("──▶ node {d: isBrowser=1}
//!                               ├──"Linux"──▶ node {d: isMobile=1, m: isMobile}
//!                               └──"iPhone"─▶ node {d: vendor=Apple}
//! ```
//!
//! A walk consumes the input prefix by prefix: at every node it takes the
//! *shortest* edge label that is a prefix of the remaining input, and stops
//! when no edge matches. When only a few attributes are wanted the walk ends
//! as soon as all of them have been seen with a non-volatile value.

#![warn(missing_docs)]

mod node;
mod walk;

pub use node::Node;
pub use walk::{Walk, Wanted};

pub use uaprobe_value::{AttributeId, IdTable, ValueId};
