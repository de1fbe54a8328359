//! A structured-clone-equivalent value codec.
//!
//! [`Value`] models everything IndexedDB admits as a stored value:
//! primitives, dates, regular expressions, binary payloads, ordered
//! mappings (plain objects), arrays, maps, and sets. Containers are held
//! behind `Rc<RefCell<_>>` so that cyclic and shared-reference value graphs
//! can be built and cloning a [`Value`] preserves reference identity rather
//! than deep-copying.
//!
//! [`Value::encode`]/[`Value::decode`] walk the graph with a reference
//! table keyed by container identity: the first time a container is visited
//! it is assigned an id and its contents are serialized; every subsequent
//! visit (including a container visiting itself) is serialized as a back
//! reference to that id. Decoding rebuilds containers in the same order,
//! pre-registering each container's handle before decoding its contents so
//! a cycle can resolve back to the container currently being built.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Errors raised while encoding or decoding a [`Value`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// The byte string is not a valid encoding (truncated, bad UTF-8, an
    /// unknown tag, or a dangling back-reference).
    #[error("malformed value encoding: {0}")]
    Malformed(String),
}

/// Shared, interior-mutable handle to a container's contents.
pub type Ref<T> = Rc<RefCell<T>>;

/// A structured-clone-equivalent value.
#[derive(Clone)]
pub enum Value {
    /// JavaScript's `undefined`; distinct from `null`.
    Undefined,
    /// `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double-precision number.
    Number(f64),
    /// A date, as milliseconds since the epoch.
    Date(f64),
    /// A string.
    String(String),
    /// Arbitrary binary data (an `ArrayBuffer` or typed array view).
    Binary(Vec<u8>),
    /// A regular expression literal.
    RegExp {
        /// The pattern source.
        source: String,
        /// The flag string (e.g. `"gi"`).
        flags: String,
    },
    /// An ordered list of values.
    Array(Ref<Vec<Value>>),
    /// A plain object: an ordered list of string-keyed entries.
    Object(Ref<Vec<(String, Value)>>),
    /// An ordered mapping from value to value.
    Map(Ref<Vec<(Value, Value)>>),
    /// An ordered, deduplicated collection of values.
    Set(Ref<Vec<Value>>),
}

impl Value {
    /// Convenience constructor for an [`Value::Object`] from entries.
    pub fn object(entries: Vec<(String, Value)>) -> Value {
        Value::Object(Rc::new(RefCell::new(entries)))
    }

    /// Convenience constructor for an [`Value::Array`] from elements.
    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    /// Whether two values are reference-identical (same backing container).
    ///
    /// Always `false` for non-container values, since primitives carry no
    /// identity of their own.
    pub fn is_same_reference(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn container_ptr(&self) -> Option<usize> {
        match self {
            Value::Array(r) => Some(Rc::as_ptr(r) as *const () as usize),
            Value::Object(r) => Some(Rc::as_ptr(r) as *const () as usize),
            Value::Map(r) => Some(Rc::as_ptr(r) as *const () as usize),
            Value::Set(r) => Some(Rc::as_ptr(r) as *const () as usize),
            _ => None,
        }
    }

    /// Encodes this value to its opaque byte representation, preserving
    /// cycles and shared references within the value tree.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::default();
        encoder.encode(self);
        encoder.out
    }

    /// Decodes a byte string produced by [`Value::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Value, ValueError> {
        let mut decoder = Decoder {
            bytes,
            pos: 0,
            table: Vec::new(),
        };
        let value = decoder.decode()?;
        if decoder.pos != bytes.len() {
            return Err(ValueError::Malformed("trailing bytes after value".into()));
        }
        Ok(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        value_eq(self, other, &mut Vec::new())
    }
}

fn value_eq(a: &Value, b: &Value, seen: &mut Vec<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
        (Value::Date(a), Value::Date(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Binary(a), Value::Binary(b)) => a == b,
        (
            Value::RegExp { source: sa, flags: fa },
            Value::RegExp { source: sb, flags: fb },
        ) => sa == sb && fa == fb,
        (Value::Array(a), Value::Array(b)) => {
            containers_eq(a, b, seen, |a, b, seen| {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| value_eq(x, y, seen))
            })
        }
        (Value::Object(a), Value::Object(b)) => containers_eq(a, b, seen, |a, b, seen| {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && value_eq(va, vb, seen))
        }),
        (Value::Map(a), Value::Map(b)) => containers_eq(a, b, seen, |a, b, seen| {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|((ka, va), (kb, vb))| value_eq(ka, kb, seen) && value_eq(va, vb, seen))
        }),
        (Value::Set(a), Value::Set(b)) => containers_eq(a, b, seen, |a, b, seen| {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| value_eq(x, y, seen))
        }),
        _ => false,
    }
}

fn containers_eq<T>(
    a: &Ref<T>,
    b: &Ref<T>,
    seen: &mut Vec<(usize, usize)>,
    compare: impl FnOnce(&T, &T, &mut Vec<(usize, usize)>) -> bool,
) -> bool {
    let pa = Rc::as_ptr(a) as *const () as usize;
    let pb = Rc::as_ptr(b) as *const () as usize;
    if seen.contains(&(pa, pb)) {
        // We're re-entering a pair we're already comparing: assume equal so
        // a cycle doesn't recurse forever, matching reference-identity
        // semantics for self-referential structures.
        return true;
    }
    seen.push((pa, pb));
    let result = compare(&a.borrow(), &b.borrow(), seen);
    seen.pop();
    result
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut visiting = Vec::new();
        fmt_value(self, f, &mut visiting)
    }
}

fn fmt_value(value: &Value, f: &mut fmt::Formatter<'_>, visiting: &mut Vec<usize>) -> fmt::Result {
    match value {
        Value::Undefined => write!(f, "undefined"),
        Value::Null => write!(f, "null"),
        Value::Bool(b) => write!(f, "{b}"),
        Value::Number(n) => write!(f, "{n}"),
        Value::Date(ms) => write!(f, "Date({ms})"),
        Value::String(s) => write!(f, "{s:?}"),
        Value::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
        Value::RegExp { source, flags } => write!(f, "/{source}/{flags}"),
        Value::Array(_) | Value::Object(_) | Value::Map(_) | Value::Set(_) => {
            let ptr = value.container_ptr().unwrap();
            if visiting.contains(&ptr) {
                return write!(f, "<cycle>");
            }
            visiting.push(ptr);
            let result = match value {
                Value::Array(items) => {
                    write!(f, "[")?;
                    for (i, item) in items.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        fmt_value(item, f, visiting)?;
                    }
                    write!(f, "]")
                }
                Value::Object(entries) => {
                    write!(f, "{{")?;
                    for (i, (k, v)) in entries.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{k:?}: ")?;
                        fmt_value(v, f, visiting)?;
                    }
                    write!(f, "}}")
                }
                Value::Map(entries) => {
                    write!(f, "Map{{")?;
                    for (i, (k, v)) in entries.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        fmt_value(k, f, visiting)?;
                        write!(f, " => ")?;
                        fmt_value(v, f, visiting)?;
                    }
                    write!(f, "}}")
                }
                Value::Set(items) => {
                    write!(f, "Set{{")?;
                    for (i, item) in items.borrow().iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        fmt_value(item, f, visiting)?;
                    }
                    write!(f, "}}")
                }
                _ => unreachable!(),
            };
            visiting.pop();
            result
        }
    }
}

const TAG_UNDEFINED: u8 = 0x00;
const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_NUMBER: u8 = 0x04;
const TAG_DATE: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_BINARY: u8 = 0x07;
const TAG_REGEXP: u8 = 0x08;
const TAG_ARRAY: u8 = 0x09;
const TAG_OBJECT: u8 = 0x0a;
const TAG_MAP: u8 = 0x0b;
const TAG_SET: u8 = 0x0c;
const TAG_REF: u8 = 0xff;

#[derive(Default)]
struct Encoder {
    out: Vec<u8>,
    seen: HashMap<usize, u32>,
}

impl Encoder {
    fn encode(&mut self, value: &Value) {
        match value {
            Value::Undefined => self.out.push(TAG_UNDEFINED),
            Value::Null => self.out.push(TAG_NULL),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Number(n) => {
                self.out.push(TAG_NUMBER);
                self.out.extend_from_slice(&n.to_be_bytes());
            }
            Value::Date(ms) => {
                self.out.push(TAG_DATE);
                self.out.extend_from_slice(&ms.to_be_bytes());
            }
            Value::String(s) => {
                self.out.push(TAG_STRING);
                self.write_bytes(s.as_bytes());
            }
            Value::Binary(bytes) => {
                self.out.push(TAG_BINARY);
                self.write_bytes(bytes);
            }
            Value::RegExp { source, flags } => {
                self.out.push(TAG_REGEXP);
                self.write_bytes(source.as_bytes());
                self.write_bytes(flags.as_bytes());
            }
            Value::Array(items) => {
                if self.write_ref_if_seen(value) {
                    return;
                }
                self.out.push(TAG_ARRAY);
                let items = items.borrow();
                self.write_u32(items.len() as u32);
                for item in items.iter() {
                    self.encode(item);
                }
            }
            Value::Object(entries) => {
                if self.write_ref_if_seen(value) {
                    return;
                }
                self.out.push(TAG_OBJECT);
                let entries = entries.borrow();
                self.write_u32(entries.len() as u32);
                for (key, val) in entries.iter() {
                    self.write_bytes(key.as_bytes());
                    self.encode(val);
                }
            }
            Value::Map(entries) => {
                if self.write_ref_if_seen(value) {
                    return;
                }
                self.out.push(TAG_MAP);
                let entries = entries.borrow();
                self.write_u32(entries.len() as u32);
                for (key, val) in entries.iter() {
                    self.encode(key);
                    self.encode(val);
                }
            }
            Value::Set(items) => {
                if self.write_ref_if_seen(value) {
                    return;
                }
                self.out.push(TAG_SET);
                let items = items.borrow();
                self.write_u32(items.len() as u32);
                for item in items.iter() {
                    self.encode(item);
                }
            }
        }
    }

    /// Registers `value`'s container identity if unseen, or writes a back
    /// reference and returns `true` if it has already been visited.
    fn write_ref_if_seen(&mut self, value: &Value) -> bool {
        let ptr = value.container_ptr().expect("container value");
        if let Some(&id) = self.seen.get(&ptr) {
            self.out.push(TAG_REF);
            self.write_u32(id);
            true
        } else {
            let id = self.seen.len() as u32;
            self.seen.insert(ptr, id);
            false
        }
    }

    fn write_u32(&mut self, n: u32) {
        self.out.extend_from_slice(&n.to_be_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.out.extend_from_slice(bytes);
    }
}

struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    table: Vec<Value>,
}

impl<'a> Decoder<'a> {
    fn decode(&mut self) -> Result<Value, ValueError> {
        let tag = self.read_u8()?;
        match tag {
            TAG_UNDEFINED => Ok(Value::Undefined),
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_NUMBER => Ok(Value::Number(f64::from_be_bytes(self.read_array()?))),
            TAG_DATE => Ok(Value::Date(f64::from_be_bytes(self.read_array()?))),
            TAG_STRING => {
                let bytes = self.read_bytes()?;
                Ok(Value::String(String::from_utf8(bytes).map_err(|_| {
                    ValueError::Malformed("invalid utf-8 in string".into())
                })?))
            }
            TAG_BINARY => Ok(Value::Binary(self.read_bytes()?)),
            TAG_REGEXP => {
                let source = self.read_string()?;
                let flags = self.read_string()?;
                Ok(Value::RegExp { source, flags })
            }
            TAG_ARRAY => {
                let handle = Rc::new(RefCell::new(Vec::new()));
                let id = self.table.len();
                self.table.push(Value::Array(handle.clone()));
                let count = self.read_u32()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                *handle.borrow_mut() = items;
                Ok(self.table[id].clone())
            }
            TAG_OBJECT => {
                let handle = Rc::new(RefCell::new(Vec::new()));
                let id = self.table.len();
                self.table.push(Value::Object(handle.clone()));
                let count = self.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = self.read_string()?;
                    let value = self.decode()?;
                    entries.push((key, value));
                }
                *handle.borrow_mut() = entries;
                Ok(self.table[id].clone())
            }
            TAG_MAP => {
                let handle = Rc::new(RefCell::new(Vec::new()));
                let id = self.table.len();
                self.table.push(Value::Map(handle.clone()));
                let count = self.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let key = self.decode()?;
                    let value = self.decode()?;
                    entries.push((key, value));
                }
                *handle.borrow_mut() = entries;
                Ok(self.table[id].clone())
            }
            TAG_SET => {
                let handle = Rc::new(RefCell::new(Vec::new()));
                let id = self.table.len();
                self.table.push(Value::Set(handle.clone()));
                let count = self.read_u32()?;
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    items.push(self.decode()?);
                }
                *handle.borrow_mut() = items;
                Ok(self.table[id].clone())
            }
            TAG_REF => {
                let id = self.read_u32()? as usize;
                self.table
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ValueError::Malformed("dangling back reference".into()))
            }
            other => Err(ValueError::Malformed(format!("unknown value tag {other:#x}"))),
        }
    }

    fn read_u8(&mut self) -> Result<u8, ValueError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| ValueError::Malformed("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ValueError> {
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or_else(|| ValueError::Malformed("unexpected end of input".into()))?;
        self.pos += N;
        Ok(slice.try_into().unwrap())
    }

    fn read_u32(&mut self) -> Result<u32, ValueError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, ValueError> {
        let len = self.read_u32()? as usize;
        let slice = self
            .bytes
            .get(self.pos..self.pos + len)
            .ok_or_else(|| ValueError::Malformed("unexpected end of input".into()))?;
        self.pos += len;
        Ok(slice.to_vec())
    }

    fn read_string(&mut self) -> Result<String, ValueError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| ValueError::Malformed("invalid utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_round_trips_primitives() {
        let values = vec![
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Number(3.5),
            Value::Date(1_700_000_000_000.0),
            Value::String("hello".into()),
            Value::Binary(vec![1, 2, 3]),
            Value::RegExp {
                source: "a+b".into(),
                flags: "gi".into(),
            },
        ];
        for value in values {
            let encoded = value.encode();
            let decoded = Value::decode(&encoded).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn it_round_trips_nested_containers() {
        let value = Value::object(vec![
            ("name".into(), Value::String("a".into())),
            (
                "tags".into(),
                Value::array(vec![Value::String("x".into()), Value::String("y".into())]),
            ),
        ]);
        let decoded = Value::decode(&value.encode()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn it_preserves_a_self_referential_cycle() {
        let array = Rc::new(RefCell::new(Vec::new()));
        array.borrow_mut().push(Value::Number(1.0));
        let cyclic = Value::Array(array.clone());
        array.borrow_mut().push(cyclic.clone());

        let encoded = cyclic.encode();
        let decoded = Value::decode(&encoded).unwrap();

        if let Value::Array(items) = &decoded {
            assert_eq!(items.borrow().len(), 2);
            assert!(items.borrow()[1].is_same_reference(&decoded));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn it_preserves_shared_references_within_one_value_tree() {
        let shared = Value::array(vec![Value::Number(1.0)]);
        let outer = Value::array(vec![shared.clone(), shared.clone()]);

        let decoded = Value::decode(&outer.encode()).unwrap();
        if let Value::Array(items) = &decoded {
            let items = items.borrow();
            assert!(items[0].is_same_reference(&items[1]));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn cloning_a_value_preserves_reference_identity() {
        let array = Value::array(vec![Value::Number(1.0)]);
        let clone = array.clone();
        assert!(array.is_same_reference(&clone));
    }
}
