//! Property microformat: a flat key → value bag as one printable token.
//!
//! ```text
//! key1=s:text,key2=i:-42,key3=x:00ff10
//! ```
//! Values carry a one-letter type tag: `s` string, `i` signed 64-bit
//! integer, `x` byte blob (lower-case hex).  Keys and string values escape
//! the reserved characters `\` `,` `=` `;` with a backslash, and control
//! characters as `\xHH`, so the output is printable and never contains an
//! unescaped [`RECORD_DELIMITER`].  That lets the directory join many bags
//! with `;` and split them again without a second escaping layer.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

pub const ESCAPE:           char = '\\';
pub const PAIR_DELIMITER:   char = ',';
pub const KV_SEPARATOR:     char = '=';
/// Separates whole bags inside a directory blob.
pub const RECORD_DELIMITER: char = ';';

const RESERVED: [char; 4] = [ESCAPE, PAIR_DELIMITER, KV_SEPARATOR, RECORD_DELIMITER];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self { PropValue::Str(v.to_owned()) }
}
impl From<String> for PropValue {
    fn from(v: String) -> Self { PropValue::Str(v) }
}
impl From<i64> for PropValue {
    fn from(v: i64) -> Self { PropValue::Int(v) }
}
impl From<Vec<u8>> for PropValue {
    fn from(v: Vec<u8>) -> Self { PropValue::Bytes(v) }
}
impl From<&[u8]> for PropValue {
    fn from(v: &[u8]) -> Self { PropValue::Bytes(v.to_vec()) }
}

/// Key-ordered property bag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyBag {
    map: BTreeMap<String, PropValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropValue> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropValue)> {
        self.map.iter()
    }

    // Typed lookups used by the directory decoder.

    pub fn str(&self, key: &str) -> Result<&str> {
        self.get(key)
            .and_then(PropValue::as_str)
            .ok_or_else(|| Error::format(format!("missing string property '{key}'")))
    }

    pub fn int(&self, key: &str) -> Result<i64> {
        self.get(key)
            .and_then(PropValue::as_int)
            .ok_or_else(|| Error::format(format!("missing integer property '{key}'")))
    }

    pub fn bytes(&self, key: &str) -> Result<&[u8]> {
        self.get(key)
            .and_then(PropValue::as_bytes)
            .ok_or_else(|| Error::format(format!("missing blob property '{key}'")))
    }

    pub fn encode(&self) -> String {
        encode(self)
    }

    pub fn decode(text: &str) -> Result<Self> {
        decode(text)
    }
}

impl fmt::Display for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self))
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────────

fn escape_into(out: &mut String, text: &str) {
    for ch in text.chars() {
        if RESERVED.contains(&ch) {
            out.push(ESCAPE);
            out.push(ch);
        } else if ch.is_control() {
            // Cc is U+0000..U+001F and U+007F..U+009F, always two hex digits.
            out.push_str(&format!("\\x{:02x}", ch as u32));
        } else {
            out.push(ch);
        }
    }
}

pub fn encode(bag: &PropertyBag) -> String {
    let mut out = String::new();
    for (i, (key, value)) in bag.map.iter().enumerate() {
        if i > 0 {
            out.push(PAIR_DELIMITER);
        }
        escape_into(&mut out, key);
        out.push(KV_SEPARATOR);
        match value {
            PropValue::Str(s) => {
                out.push_str("s:");
                escape_into(&mut out, s);
            }
            PropValue::Int(v) => {
                out.push_str("i:");
                out.push_str(&v.to_string());
            }
            PropValue::Bytes(b) => {
                out.push_str("x:");
                out.push_str(&hex::encode(b));
            }
        }
    }
    out
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Split on every `delim` that is not escaped.  Escape sequences are kept
/// intact for the later [`unescape`]; a trailing lone escape is an error.
pub fn split_unescaped(text: &str, delim: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices();
    while let Some((i, ch)) = chars.next() {
        if ch == ESCAPE {
            if chars.next().is_none() {
                return Err(Error::format("unterminated escape sequence"));
            }
        } else if ch == delim {
            parts.push(&text[start..i]);
            start = i + ch.len_utf8();
        }
    }
    parts.push(&text[start..]);
    Ok(parts)
}

fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE {
            out.push(ch);
            continue;
        }
        match chars.next() {
            None => return Err(Error::format("unterminated escape sequence")),
            Some('x') => {
                let hi = chars.next();
                let lo = chars.next();
                let code = match (hi, lo) {
                    (Some(h), Some(l)) => {
                        let pair: String = [h, l].iter().collect();
                        u32::from_str_radix(&pair, 16)
                            .map_err(|_| Error::format(format!("bad hex escape '\\x{pair}'")))?
                    }
                    _ => return Err(Error::format("unterminated hex escape")),
                };
                let decoded = char::from_u32(code)
                    .ok_or_else(|| Error::format(format!("invalid escaped code point {code:#x}")))?;
                out.push(decoded);
            }
            Some(c) if RESERVED.contains(&c) => out.push(c),
            Some(c) => return Err(Error::format(format!("unknown escape '\\{c}'"))),
        }
    }
    Ok(out)
}

fn decode_value(raw: &str) -> Result<PropValue> {
    let (tag, body) = raw
        .split_once(':')
        .ok_or_else(|| Error::format(format!("value '{raw}' has no type tag")))?;
    match tag {
        "s" => Ok(PropValue::Str(unescape(body)?)),
        "i" => body
            .parse::<i64>()
            .map(PropValue::Int)
            .map_err(|_| Error::format(format!("bad integer '{body}'"))),
        "x" => hex::decode(body)
            .map(PropValue::Bytes)
            .map_err(|e| Error::format(format!("bad blob: {e}"))),
        other => Err(Error::format(format!("unknown value tag '{other}'"))),
    }
}

pub fn decode(text: &str) -> Result<PropertyBag> {
    let mut bag = PropertyBag::new();
    if text.is_empty() {
        return Ok(bag);
    }
    for pair in split_unescaped(text, PAIR_DELIMITER)? {
        let mut kv = split_unescaped(pair, KV_SEPARATOR)?.into_iter();
        let (key, value) = match (kv.next(), kv.next(), kv.next()) {
            (Some(k), Some(v), None) => (k, v),
            _ => return Err(Error::format(format!("malformed token '{pair}'"))),
        };
        let key = unescape(key)?;
        if bag.map.contains_key(&key) {
            return Err(Error::format(format!("duplicate key '{key}'")));
        }
        bag.map.insert(key, decode_value(value)?);
    }
    Ok(bag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_typed_values() {
        let mut bag = PropertyBag::new();
        bag.insert("name", "a.txt");
        bag.insert("size", 5i64);
        bag.insert("iv", vec![0x00u8, 0xff]);
        assert_eq!(bag.encode(), "iv=x:00ff,name=s:a.txt,size=i:5");
        assert_eq!(PropertyBag::decode(&bag.encode()).unwrap(), bag);
    }

    #[test]
    fn reserved_characters_survive() {
        let mut bag = PropertyBag::new();
        bag.insert("k;,=\\", "v;a,l=u\\e;");
        bag.insert("ctl", "tab\there\nnewline");
        let text = bag.encode();
        assert!(split_unescaped(&text, RECORD_DELIMITER).unwrap().len() == 1);
        assert!(!text.chars().any(char::is_control));
        assert_eq!(decode(&text).unwrap(), bag);
    }

    #[test]
    fn malformed_tokens_are_format_errors() {
        for bad in ["novalue", "k=s:ok,broken", "k=s:trailing\\", "k=q:1", "k=i:1x", "k=x:zz", "k=s:\\x4"] {
            let err = decode(bad).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Format, "input {bad:?}");
        }
    }

    #[test]
    fn empty_text_is_empty_bag() {
        assert!(decode("").unwrap().is_empty());
        assert_eq!(PropertyBag::new().encode(), "");
    }

    fn value_strategy() -> impl Strategy<Value = PropValue> {
        prop_oneof![
            any::<String>().prop_map(PropValue::Str),
            any::<i64>().prop_map(PropValue::Int),
            proptest::collection::vec(any::<u8>(), 0..40).prop_map(PropValue::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            entries in proptest::collection::btree_map(any::<String>(), value_strategy(), 0..8)
        ) {
            let mut bag = PropertyBag::new();
            for (k, v) in entries {
                bag.insert(k, v);
            }
            let text = bag.encode();
            prop_assert_eq!(decode(&text).unwrap(), bag);
        }

        #[test]
        fn delimiter_heavy_strings_roundtrip(s in "[;,=\\\\a-c]{0,24}") {
            let mut bag = PropertyBag::new();
            bag.insert(s.clone(), s.clone());
            let text = bag.encode();
            prop_assert_eq!(split_unescaped(&text, RECORD_DELIMITER).unwrap().len(), 1);
            prop_assert_eq!(decode(&text).unwrap(), bag);
        }
    }
}
