//! Typed values carried by a frame.
//!
//! A [`Record`] is an ordered list of named [`Value`]s. Schemas decide the
//! wire layout; records only hold data, so the same record type serves every
//! packet.

use std::fmt;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Any fixed-width unsigned integer. The schema decides the width.
    Int(u64),
    /// Fixed-width or trailing string.
    Str(String),
    /// Trailing raw bytes.
    Bytes(Vec<u8>),
    /// Fixed-length array of elements.
    Array(Vec<Value>),
    /// Nested named group of fields (array element composites).
    Group(Record),
}

impl Value {
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Record> {
        match self {
            Value::Group(r) => Some(r),
            _ => None,
        }
    }

    /// Short name of the variant, used in mismatch messages.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Group(_) => "group",
        }
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(v.into())
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Group(v)
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(items: [T; N]) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

/// Named field values of one packet (or one nested group).
///
/// Equality ignores field order: two records are equal when they hold the
/// same names with equal values.
#[derive(Debug, Clone, Default)]
pub struct Record {
    fields: Vec<(&'static str, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a field.
    pub fn set(&mut self, name: &'static str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| *n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.fields.iter().map(|(n, v)| (*n, v))
    }

    pub fn int(&self, name: &str) -> Option<u64> {
        self.get(name)?.as_int()
    }

    pub fn u8(&self, name: &str) -> Option<u8> {
        u8::try_from(self.int(name)?).ok()
    }

    pub fn u16(&self, name: &str) -> Option<u16> {
        u16::try_from(self.int(name)?).ok()
    }

    pub fn u32(&self, name: &str) -> Option<u32> {
        u32::try_from(self.int(name)?).ok()
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name)?.as_bytes()
    }

    pub fn array(&self, name: &str) -> Option<&[Value]> {
        self.get(name)?.as_array()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(n, v)| other.get(n).is_some_and(|o| o == v))
    }
}

impl Eq for Record {}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Value::Int(v) => write!(f, "{name}={v}")?,
                Value::Str(s) => write!(f, "{name}={s:?}")?,
                Value::Bytes(b) => write!(f, "{name}=<{} bytes>", b.len())?,
                Value::Array(items) => write!(f, "{name}=[{} items]", items.len())?,
                Value::Group(g) => write!(f, "{name}={g}")?,
            }
        }
        f.write_str("}")
    }
}
