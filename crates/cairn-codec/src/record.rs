use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::error::{CodecError, CodecResult};
use crate::value::{Timestamp, Value};

/// Insertion-ordered map from string keys to [`Value`]s.
///
/// Inserting a key that is already present replaces its value in place, so
/// the position of a key is fixed by its first insertion. Records are small
/// (a handful of fields) and lookups are linear.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    entries: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace. Returns the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    // ---------------------------------------------------------------
    // Typed accessors
    // ---------------------------------------------------------------

    fn require(&self, key: &str) -> CodecResult<&Value> {
        self.get(key)
            .ok_or_else(|| CodecError::MissingField(key.to_string()))
    }

    fn mismatch(key: &str, expected: &'static str, actual: &Value) -> CodecError {
        CodecError::TypeMismatch {
            field: key.to_string(),
            expected,
            actual: actual.kind_name(),
        }
    }

    pub fn str(&self, key: &str) -> CodecResult<&str> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            other => Err(Self::mismatch(key, "string", other)),
        }
    }

    pub fn bytes(&self, key: &str) -> CodecResult<&[u8]> {
        match self.require(key)? {
            Value::Bytes(b) => Ok(b),
            other => Err(Self::mismatch(key, "bytes", other)),
        }
    }

    pub fn boolean(&self, key: &str) -> CodecResult<bool> {
        match self.require(key)? {
            Value::Bool(b) => Ok(*b),
            other => Err(Self::mismatch(key, "bool", other)),
        }
    }

    pub fn int(&self, key: &str) -> CodecResult<i32> {
        match self.require(key)? {
            Value::Int(i) => Ok(*i),
            other => Err(Self::mismatch(key, "int", other)),
        }
    }

    /// Reads a long, widening an int if that is what was stored.
    pub fn long(&self, key: &str) -> CodecResult<i64> {
        match self.require(key)? {
            Value::Long(l) => Ok(*l),
            Value::Int(i) => Ok(i64::from(*i)),
            other => Err(Self::mismatch(key, "long", other)),
        }
    }

    pub fn timestamp(&self, key: &str) -> CodecResult<Timestamp> {
        match self.require(key)? {
            Value::Timestamp(t) => Ok(*t),
            other => Err(Self::mismatch(key, "timestamp", other)),
        }
    }

    pub fn list(&self, key: &str) -> CodecResult<&[Value]> {
        match self.require(key)? {
            Value::List(items) => Ok(items),
            other => Err(Self::mismatch(key, "list", other)),
        }
    }

    pub fn map(&self, key: &str) -> CodecResult<&Record> {
        match self.require(key)? {
            Value::Map(r) => Ok(r),
            other => Err(Self::mismatch(key, "map", other)),
        }
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Conversion of a typed structure into its persisted [`Record`] form.
pub trait ToRecord {
    fn to_record(&self) -> Record;
}

/// Reconstruction of a typed structure from a decoded [`Record`].
///
/// Implementations report missing or mistyped fields through
/// [`CodecError::MissingField`] and [`CodecError::TypeMismatch`].
pub trait FromRecord: Sized {
    fn from_record(record: &Record) -> CodecResult<Self>;
}

impl ToRecord for Record {
    fn to_record(&self) -> Record {
        self.clone()
    }
}

impl FromRecord for Record {
    fn from_record(record: &Record) -> CodecResult<Self> {
        Ok(record.clone())
    }
}
