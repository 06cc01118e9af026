//! Qualified key/value parameter maps.
//!
//! Event sources and operations like `open_connection` are configured through
//! an open-schema map from a qualified name (a 16-bit namespace plus a local
//! name) to a typed value. Consumers read the keys they know; unknown
//! non-mandatory keys are ignored without error.

use ahash::AHashMap;

/// A qualified parameter name: numeric namespace plus local name.
/// The reference namespace is 0.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedKey {
    pub ns: u16,
    pub name: String,
}

impl QualifiedKey {
    pub fn new(ns: u16, name: &str) -> Self {
        QualifiedKey {
            ns,
            name: name.to_string(),
        }
    }
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    U16(u16),
    U64(u64),
    Bool(bool),
    Str(String),
    StrArray(Vec<String>),
    Bytes(Vec<u8>),
}

/// Unordered map from qualified name to typed value.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    entries: AHashMap<QualifiedKey, ParamValue>,
}

impl ParamMap {
    pub fn new() -> Self {
        ParamMap::default()
    }

    /// Insert or replace a value under `(ns, name)`.
    pub fn set(&mut self, ns: u16, name: &str, value: ParamValue) {
        self.entries.insert(QualifiedKey::new(ns, name), value);
    }

    pub fn get(&self, ns: u16, name: &str) -> Option<&ParamValue> {
        self.entries.get(&QualifiedKey::new(ns, name))
    }

    pub fn contains(&self, ns: u16, name: &str) -> bool {
        self.get(ns, name).is_some()
    }

    pub fn remove(&mut self, ns: u16, name: &str) -> Option<ParamValue> {
        self.entries.remove(&QualifiedKey::new(ns, name))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Typed getter; `None` when absent or of a different type.
    pub fn get_u16(&self, ns: u16, name: &str) -> Option<u16> {
        match self.get(ns, name) {
            Some(ParamValue::U16(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, ns: u16, name: &str) -> Option<u64> {
        match self.get(ns, name) {
            Some(ParamValue::U64(v)) => Some(*v),
            Some(ParamValue::U16(v)) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_bool(&self, ns: u16, name: &str) -> Option<bool> {
        match self.get(ns, name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, ns: u16, name: &str) -> Option<&str> {
        match self.get(ns, name) {
            Some(ParamValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// A string value is treated as a one-element array.
    pub fn get_str_array(&self, ns: u16, name: &str) -> Option<Vec<&str>> {
        match self.get(ns, name) {
            Some(ParamValue::Str(v)) => Some(vec![v.as_str()]),
            Some(ParamValue::StrArray(vs)) => Some(vs.iter().map(|s| s.as_str()).collect()),
            _ => None,
        }
    }
}
