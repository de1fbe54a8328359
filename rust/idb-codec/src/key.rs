//! An order-preserving byte encoding for the handful of types IndexedDB
//! admits as keys: numbers, dates, strings, binary data, and arrays of keys.
//!
//! The produced byte strings compare with plain `memcmp` (in Rust, `Ord` on
//! `[u8]`) in exactly the order the client-facing key type requires:
//! `number < date < string < binary < array`, with natural order inside each
//! type and element-wise lexicographic order inside arrays (a shorter array
//! that is a prefix of a longer one sorts first).

use std::cmp::Ordering;
use thiserror::Error;

use crate::value::Value;

/// Errors raised while validating or extracting keys.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    /// A value is not admissible as a key (not a number/date/string/binary,
    /// not a finite number, a negative or non-finite date, or an array
    /// containing an inadmissible element).
    #[error("invalid key: {0}")]
    DataError(String),
}

const TAG_NUMBER: u8 = 0x10;
const TAG_DATE: u8 = 0x20;
const TAG_STRING: u8 = 0x30;
const TAG_BINARY: u8 = 0x40;
const TAG_ARRAY: u8 = 0x50;

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xff;
const TERMINATOR: u8 = 0x00;
const ARRAY_CONTINUE: u8 = 0x01;
const ARRAY_END: u8 = 0x00;

/// A client-facing key, in the shape the IndexedDB key type admits.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// A finite, non-NaN number.
    Number(f64),
    /// Milliseconds since the epoch; must be finite and non-negative.
    Date(f64),
    /// An arbitrary string.
    String(String),
    /// Arbitrary binary data (an `ArrayBuffer` or typed array view).
    Binary(Vec<u8>),
    /// An ordered sequence of keys.
    Array(Vec<Key>),
}

impl Key {
    /// Validates and converts a decoded [`Value`] into a [`Key`].
    ///
    /// Mirrors `validate()` in the key codec specification: only numbers,
    /// dates, strings, binary payloads, and arrays of valid keys pass.
    pub fn try_from_value(value: &Value) -> Result<Key, KeyError> {
        match value {
            Value::Number(n) => {
                if n.is_finite() {
                    Ok(Key::Number(*n))
                } else {
                    Err(KeyError::DataError(
                        "number keys must be finite and not NaN".into(),
                    ))
                }
            }
            Value::Date(ms) => {
                if ms.is_finite() && *ms >= 0.0 {
                    Ok(Key::Date(*ms))
                } else {
                    Err(KeyError::DataError(
                        "date keys must be finite and non-negative".into(),
                    ))
                }
            }
            Value::String(s) => Ok(Key::String(s.clone())),
            Value::Binary(bytes) => Ok(Key::Binary(bytes.clone())),
            Value::Array(items) => {
                let items = items.borrow();
                let keys = items
                    .iter()
                    .map(Key::try_from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Key::Array(keys))
            }
            _ => Err(KeyError::DataError(format!(
                "{value:?} is not a valid key"
            ))),
        }
    }

    /// Encodes this key to its order-preserving byte representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Key::Number(n) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&sortable_f64_bits(*n).to_be_bytes());
            }
            Key::Date(ms) => {
                out.push(TAG_DATE);
                out.extend_from_slice(&sortable_f64_bits(*ms).to_be_bytes());
            }
            Key::String(s) => {
                out.push(TAG_STRING);
                encode_escaped(s.as_bytes(), out);
            }
            Key::Binary(bytes) => {
                out.push(TAG_BINARY);
                encode_escaped(bytes, out);
            }
            Key::Array(items) => {
                out.push(TAG_ARRAY);
                for item in items {
                    out.push(ARRAY_CONTINUE);
                    item.encode_into(out);
                }
                out.push(ARRAY_END);
            }
        }
    }

    /// Decodes a byte string produced by [`Key::encode`] back into a [`Key`].
    ///
    /// `decode(encode(k))` always deep-equals `k` for a valid key `k`.
    pub fn decode(bytes: &[u8]) -> Result<Key, KeyError> {
        let (key, rest) = Self::decode_one(bytes)?;
        if !rest.is_empty() {
            return Err(KeyError::DataError("trailing bytes after key".into()));
        }
        Ok(key)
    }

    fn decode_one(bytes: &[u8]) -> Result<(Key, &[u8]), KeyError> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| KeyError::DataError("empty key encoding".into()))?;
        match tag {
            TAG_NUMBER | TAG_DATE => {
                if rest.len() < 8 {
                    return Err(KeyError::DataError("truncated numeric key".into()));
                }
                let (bits, rest) = rest.split_at(8);
                let bits = u64::from_be_bytes(bits.try_into().unwrap());
                let value = sortable_bits_f64(bits);
                let key = if tag == TAG_NUMBER {
                    Key::Number(value)
                } else {
                    Key::Date(value)
                };
                Ok((key, rest))
            }
            TAG_STRING => {
                let (bytes, rest) = decode_escaped(rest)?;
                let s = String::from_utf8(bytes)
                    .map_err(|_| KeyError::DataError("invalid utf-8 in string key".into()))?;
                Ok((Key::String(s), rest))
            }
            TAG_BINARY => {
                let (bytes, rest) = decode_escaped(rest)?;
                Ok((Key::Binary(bytes), rest))
            }
            TAG_ARRAY => {
                let mut items = Vec::new();
                let mut rest = rest;
                loop {
                    let (&marker, tail) = rest
                        .split_first()
                        .ok_or_else(|| KeyError::DataError("unterminated array key".into()))?;
                    if marker == ARRAY_END {
                        rest = tail;
                        break;
                    }
                    let (item, tail) = Self::decode_one(tail)?;
                    items.push(item);
                    rest = tail;
                }
                Ok((Key::Array(items), rest))
            }
            other => Err(KeyError::DataError(format!("unknown key tag {other:#x}"))),
        }
    }

    /// Byte-wise comparison of two keys via their encodings.
    pub fn compare(a: &Key, b: &Key) -> Ordering {
        a.encode().as_slice().cmp(b.encode().as_slice())
    }
}

/// Compares two already-encoded keys with plain `memcmp` order.
pub fn compare_encoded(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

fn sortable_f64_bits(x: f64) -> u64 {
    let bits = x.to_bits();
    if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    }
}

fn sortable_bits_f64(bits: u64) -> f64 {
    if bits & (1u64 << 63) != 0 {
        f64::from_bits(bits & !(1u64 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

fn encode_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(ESCAPED_NUL);
        } else {
            out.push(b);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

fn decode_escaped(bytes: &[u8]) -> Result<(Vec<u8>, &[u8]), KeyError> {
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        if i >= bytes.len() {
            return Err(KeyError::DataError("unterminated escaped byte run".into()));
        }
        if bytes[i] == ESCAPE {
            let marker = *bytes
                .get(i + 1)
                .ok_or_else(|| KeyError::DataError("truncated escape sequence".into()))?;
            if marker == TERMINATOR {
                return Ok((out, &bytes[i + 2..]));
            } else if marker == ESCAPED_NUL {
                out.push(0);
                i += 2;
            } else {
                return Err(KeyError::DataError("invalid escape sequence".into()));
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
}

/// A dotted key path (`"a.b.c"`) or an ordered sequence of such paths, used
/// to derive a key (or a compound key) from a stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPath {
    /// The store has no key path; keys are supplied out-of-line.
    None,
    /// A single dotted path.
    Single(String),
    /// An ordered sequence of dotted paths, producing a compound array key.
    Sequence(Vec<String>),
}

impl KeyPath {
    /// Extracts a key from `value` following this path.
    ///
    /// Returns `Ok(None)` if any path segment is missing (the IndexedDB
    /// "key unspecified" case). Returns `Err` if a segment resolves to a
    /// value that isn't itself a valid key.
    pub fn extract(&self, value: &Value) -> Result<Option<Key>, KeyError> {
        match self {
            KeyPath::None => Ok(None),
            KeyPath::Single(path) => extract_single(value, path),
            KeyPath::Sequence(paths) => {
                let mut components = Vec::with_capacity(paths.len());
                for path in paths {
                    match extract_single(value, path)? {
                        Some(key) => components.push(key),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Key::Array(components)))
            }
        }
    }
}

fn extract_single(value: &Value, path: &str) -> Result<Option<Key>, KeyError> {
    let mut current = value.clone();
    for segment in path.split('.') {
        match get_property(&current, segment) {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Key::try_from_value(&current).map(Some)
}

fn get_property(value: &Value, segment: &str) -> Option<Value> {
    match value {
        Value::Object(entries) => entries
            .borrow()
            .iter()
            .find(|(k, _)| k == segment)
            .map(|(_, v)| v.clone()),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|idx| items.borrow().get(idx).cloned()),
        _ => None,
    }
}

/// A half-open or closed interval over encoded keys.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyRange {
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// Matches exactly the keys equal to `value`.
    pub fn only(value: &Key) -> KeyRange {
        let encoded = value.encode();
        KeyRange {
            lower: Some(encoded.clone()),
            upper: Some(encoded),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Matches keys `>= value` (or `> value` if `open`).
    pub fn lower_bound(value: &Key, open: bool) -> KeyRange {
        KeyRange {
            lower: Some(value.encode()),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    /// Matches keys `<= value` (or `< value` if `open`).
    pub fn upper_bound(value: &Key, open: bool) -> KeyRange {
        KeyRange {
            lower: None,
            upper: Some(value.encode()),
            lower_open: false,
            upper_open: open,
        }
    }

    /// Matches keys between `lower` and `upper`, with open/closed endpoints.
    pub fn bound(lower: &Key, upper: &Key, lower_open: bool, upper_open: bool) -> KeyRange {
        KeyRange {
            lower: Some(lower.encode()),
            upper: Some(upper.encode()),
            lower_open,
            upper_open,
        }
    }

    /// Matches every key (no bounds).
    pub fn unbounded() -> KeyRange {
        KeyRange::default()
    }

    /// Whether the given encoded key falls within this range.
    pub fn includes(&self, encoded_key: &[u8]) -> bool {
        if let Some(lower) = &self.lower {
            match encoded_key.cmp(lower.as_slice()) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match encoded_key.cmp(upper.as_slice()) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }

    /// The encoded lower bound, if any.
    pub fn lower(&self) -> Option<&[u8]> {
        self.lower.as_deref()
    }

    /// Whether the lower bound is exclusive.
    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    /// The encoded upper bound, if any.
    pub fn upper(&self) -> Option<&[u8]> {
        self.upper.as_deref()
    }

    /// Whether the upper bound is exclusive.
    pub fn upper_open(&self) -> bool {
        self.upper_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(k: Key) -> Vec<u8> {
        k.encode()
    }

    #[test]
    fn it_round_trips_every_key_shape() {
        let keys = vec![
            Key::Number(0.0),
            Key::Number(-42.5),
            Key::Number(f64::MAX),
            Key::Date(1_700_000_000_000.0),
            Key::String("hello".into()),
            Key::String(String::new()),
            Key::String("has\u{0}nul".into()),
            Key::Binary(vec![1, 2, 3, 0, 255]),
            Key::Array(vec![Key::Number(1.0), Key::String("a".into())]),
            Key::Array(vec![]),
        ];
        for key in keys {
            let encoded = key.encode();
            let decoded = Key::decode(&encoded).expect("decodes");
            assert_eq!(decoded, key);
        }
    }

    #[test]
    fn it_orders_numbers_before_dates_before_strings_before_binary_before_arrays() {
        let number = enc(Key::Number(1_000_000.0));
        let date = enc(Key::Date(0.0));
        let string = enc(Key::String("".into()));
        let binary = enc(Key::Binary(vec![]));
        let array = enc(Key::Array(vec![]));

        assert!(number < date);
        assert!(date < string);
        assert!(string < binary);
        assert!(binary < array);
    }

    #[test]
    fn it_orders_numbers_numerically_including_negatives() {
        let values = [-100.0, -1.5, -0.0, 0.0, 1.5, 100.0];
        let mut encoded: Vec<_> = values.iter().map(|v| enc(Key::Number(*v))).collect();
        let sorted = {
            let mut s = encoded.clone();
            s.sort();
            s
        };
        encoded.sort();
        assert_eq!(encoded, sorted);
        assert!(enc(Key::Number(-1.5)) < enc(Key::Number(0.0)));
        assert!(enc(Key::Number(0.0)) < enc(Key::Number(1.5)));
    }

    #[test]
    fn it_orders_arrays_lexicographically_with_shorter_prefix_first() {
        let a = enc(Key::Array(vec![Key::Number(1.0)]));
        let b = enc(Key::Array(vec![Key::Number(1.0), Key::Number(0.0)]));
        let empty = enc(Key::Array(vec![]));
        assert!(empty < a);
        assert!(a < b);
    }

    #[test]
    fn it_rejects_nan_and_infinite_numbers() {
        assert!(Key::try_from_value(&Value::Number(f64::NAN)).is_err());
        assert!(Key::try_from_value(&Value::Number(f64::INFINITY)).is_err());
    }

    #[test]
    fn it_rejects_negative_dates() {
        assert!(Key::try_from_value(&Value::Date(-1.0)).is_err());
    }

    #[test]
    fn it_extracts_a_dotted_key_path() {
        let value = Value::object(vec![(
            "user".into(),
            Value::object(vec![("id".into(), Value::Number(42.0))]),
        )]);
        let extracted = KeyPath::Single("user.id".into()).extract(&value).unwrap();
        assert_eq!(extracted, Some(Key::Number(42.0)));
    }

    #[test]
    fn it_returns_none_for_a_missing_path_segment() {
        let value = Value::object(vec![("id".into(), Value::Number(1.0))]);
        let extracted = KeyPath::Single("missing.path".into())
            .extract(&value)
            .unwrap();
        assert_eq!(extracted, None);
    }

    #[test]
    fn it_builds_a_compound_key_from_a_sequence_path() {
        let value = Value::object(vec![
            ("a".into(), Value::Number(1.0)),
            ("b".into(), Value::Number(2.0)),
        ]);
        let path = KeyPath::Sequence(vec!["a".into(), "b".into()]);
        let extracted = path.extract(&value).unwrap();
        assert_eq!(
            extracted,
            Some(Key::Array(vec![Key::Number(1.0), Key::Number(2.0)]))
        );
    }

    #[test]
    fn it_matches_a_key_range() {
        let range = KeyRange::bound(&Key::Number(1.0), &Key::Number(10.0), false, true);
        assert!(!range.includes(&Key::Number(0.0).encode()));
        assert!(range.includes(&Key::Number(1.0).encode()));
        assert!(range.includes(&Key::Number(9.9).encode()));
        assert!(!range.includes(&Key::Number(10.0).encode()));
    }
}
