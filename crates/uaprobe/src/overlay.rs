//! Client-supplied attribute overlays
//!
//! Clients can report attributes the server cannot infer (screen size, WebGL
//! support, ...). They arrive as a compact string:
//!
//! ```text
//! bjs.webGl:1|sdeviceAspectRatio:16/10|idisplayWidth:1080
//! ```
//!
//! Each token is `<typeChar><name>:<rawValue>`; the type char is `b`
//! (boolean), `i` (integer), `s` (string) or `d` (date). The whole string may
//! be wrapped in double quotes.

use crate::error::{Result, UaprobeError};
use crate::lookup::Properties;
use std::collections::BTreeMap;
use std::fmt;
use uaprobe_value::{TypeTag, Value};

/// One overlay attribute
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayValue {
    /// Type declared by the token's type char
    pub tag: TypeTag,
    /// Sanitized value: an integer for `b`/`i`, a string for `s`/`d`
    pub raw: Value,
    /// Value as written back to the wire form, before sanitizing
    wire: String,
}

impl OverlayValue {
    /// Value converted to its declared type
    pub fn typed(&self) -> Value {
        self.raw.typed(self.tag)
    }
}

/// A parsed client overlay (attribute name → typed value)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientOverlay {
    entries: BTreeMap<String, OverlayValue>,
}

impl ClientOverlay {
    /// Parse the wire form
    ///
    /// An empty string gives an empty overlay. A non-empty string that yields
    /// no attribute, or any token with an unknown type char, is an error.
    pub fn parse(input: &str) -> Result<Self> {
        let mut overlay = ClientOverlay::default();
        let body = input.trim_matches('"');
        if input.is_empty() {
            return Ok(overlay);
        }

        for token in body.split('|') {
            let Some((type_and_name, raw)) = token.split_once(':') else {
                continue;
            };
            if !is_valid_name(type_and_name) {
                continue;
            }
            let Some((type_char, name)) = split_type_char(type_and_name) else {
                continue;
            };

            let (tag, raw, wire) = match type_char {
                'b' | 'i' => {
                    let tag = if type_char == 'b' { TypeTag::Boolean } else { TypeTag::Integer };
                    let n = Value::from(raw).cast_int();
                    (tag, Value::Int(n), n.to_string())
                }
                's' | 'd' => {
                    let tag = if type_char == 's' { TypeTag::String } else { TypeTag::Date };
                    let text = raw.trim_matches('"');
                    (tag, Value::String(sanitize(text)), text.to_string())
                }
                other => {
                    return Err(UaprobeError::ClientOverlay(format!(
                        "unsupported type {:?} in {:?}",
                        other, token
                    )))
                }
            };

            if name.is_empty() {
                continue;
            }
            overlay.entries.insert(name.to_string(), OverlayValue { tag, raw, wire });
        }

        if overlay.entries.is_empty() {
            return Err(UaprobeError::ClientOverlay(format!(
                "no attributes in {:?}",
                input
            )));
        }
        Ok(overlay)
    }

    /// Overlay entry for `name`
    pub fn get(&self, name: &str) -> Option<&OverlayValue> {
        self.entries.get(name)
    }

    /// Whether the overlay carries `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Whether the overlay declares `name` with type `tag`
    pub fn declares(&self, name: &str, tag: TypeTag) -> bool {
        self.entries.get(name).is_some_and(|e| e.tag == tag)
    }

    /// Value for `name`, typed or raw
    pub fn value(&self, name: &str, typed: bool) -> Option<Value> {
        self.entries
            .get(name)
            .map(|e| if typed { e.typed() } else { e.raw.clone() })
    }

    /// Iterate entries in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OverlayValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the overlay is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every entry into `props`, replacing existing values
    pub fn merge_into(&self, props: &mut Properties, typed: bool) {
        for (name, entry) in &self.entries {
            let value = if typed { entry.typed() } else { entry.raw.clone() };
            props.insert(name.clone(), value);
        }
    }
}

/// Writes the wire form
///
/// String values are written as received, so parsing the output sanitizes
/// them exactly once.
impl fmt::Display for ClientOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, entry)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{}{}:{}", entry.tag.prefix(), name, entry.wire)?;
        }
        Ok(())
    }
}

fn is_valid_name(type_and_name: &str) -> bool {
    !type_and_name.is_empty()
        && type_and_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.')
}

fn split_type_char(type_and_name: &str) -> Option<(char, &str)> {
    let mut chars = type_and_name.chars();
    let first = chars.next()?;
    Some((first, chars.as_str()))
}

/// HTML-encode `&"'<>` and ASCII control characters as numeric entities
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' | '"' | '\'' | '<' | '>' => out.push_str(&format!("&#{};", c as u32)),
            c if (c as u32) < 32 => out.push_str(&format!("&#{};", c as u32)),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_types() {
        let overlay =
            ClientOverlay::parse("\"bjs.webGl:1|sdeviceAspectRatio:16/10|idisplayWidth:1080px|dreleased:\"2020\"\"")
                .unwrap();
        assert_eq!(overlay.len(), 4);
        assert_eq!(overlay.value("js.webGl", true), Some(Value::Bool(true)));
        assert_eq!(overlay.value("js.webGl", false), Some(Value::Int(1)));
        assert_eq!(overlay.value("deviceAspectRatio", true), Some(Value::from("16/10")));
        assert_eq!(overlay.value("displayWidth", true), Some(Value::Int(1080)));
        assert_eq!(overlay.value("released", true), Some(Value::from("2020")));
        assert!(overlay.declares("displayWidth", TypeTag::Integer));
        assert!(!overlay.declares("displayWidth", TypeTag::String));
    }

    #[test]
    fn test_non_numeric_integer_is_zero() {
        let overlay = ClientOverlay::parse("bisTablet:yes").unwrap();
        assert_eq!(overlay.value("isTablet", true), Some(Value::Bool(false)));
    }

    #[test]
    fn test_skips_bad_tokens() {
        let overlay = ClientOverlay::parse("bisTablet:1|noColon|b-bad:1|:1|sname:ok").unwrap();
        assert_eq!(overlay.len(), 2);
        assert!(overlay.contains("isTablet"));
        assert!(overlay.contains("name"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            ClientOverlay::parse("xfoo:1"),
            Err(UaprobeError::ClientOverlay(_))
        ));
        assert!(matches!(
            ClientOverlay::parse("garbage"),
            Err(UaprobeError::ClientOverlay(_))
        ));
        assert!(ClientOverlay::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_value_with_colon() {
        let overlay = ClientOverlay::parse("surl:http://a.b").unwrap();
        assert_eq!(overlay.value("url", false), Some(Value::from("http://a.b")));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("<b>&'\""), "&#60;b&#62;&#38;&#39;&#34;");
        assert_eq!(sanitize("a\tb"), "a&#9;b");
        assert_eq!(sanitize("plain"), "plain");
    }

    #[test]
    fn test_display_round_trip() {
        let overlay = ClientOverlay::parse("bisTablet:1|sdeviceAspectRatio:16/10|iwidth:-5").unwrap();
        let wire = overlay.to_string();
        assert_eq!(wire, "sdeviceAspectRatio:16/10|bisTablet:1|iwidth:-5");
        assert_eq!(ClientOverlay::parse(&wire).unwrap(), overlay);
    }

    #[test]
    fn test_display_keeps_unsanitized_text() {
        let overlay = ClientOverlay::parse("sname:Tom & \"Jerry\"|surl:http://a.b|bisTablet:7x").unwrap();
        assert_eq!(overlay.value("name", false), Some(Value::from("Tom &#38; &#34;Jerry")));

        let wire = overlay.to_string();
        assert_eq!(wire, "bisTablet:7|sname:Tom & \"Jerry|surl:http://a.b");
        let again = ClientOverlay::parse(&wire).unwrap();
        assert_eq!(again, overlay);
        assert_eq!(again.to_string(), wire);
    }

    #[test]
    fn test_merge_into() {
        let overlay = ClientOverlay::parse("bisTablet:1").unwrap();
        let mut props = Properties::default();
        props.insert("isTablet", Value::Bool(false));
        overlay.merge_into(&mut props, true);
        assert_eq!(props.get("isTablet"), Some(&Value::Bool(true)));
    }
}
