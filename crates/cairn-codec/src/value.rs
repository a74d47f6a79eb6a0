use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::CodecError;
use crate::record::Record;

/// Wire tag identifying the kind of an encoded value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Bytes = 1,
    Bool = 2,
    Int = 3,
    Long = 4,
    String = 5,
    Timestamp = 6,
    List = 7,
    Map = 8,
}

impl TryFrom<u8> for Tag {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            1 => Ok(Self::Bytes),
            2 => Ok(Self::Bool),
            3 => Ok(Self::Int),
            4 => Ok(Self::Long),
            5 => Ok(Self::String),
            6 => Ok(Self::Timestamp),
            7 => Ok(Self::List),
            8 => Ok(Self::Map),
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// Point in time with millisecond precision.
///
/// Stored as milliseconds since the Unix epoch so that every value survives
/// an encode/decode cycle unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time, truncated to milliseconds.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub const fn millis(&self) -> i64 {
        self.0
    }

    /// `None` when the value is outside chrono's representable range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_datetime() {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_i64(self.0),
        }
    }
}

/// A single typed value inside a [`Record`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bytes(Vec<u8>),
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
    Timestamp(Timestamp),
    List(Vec<Value>),
    Map(Record),
}

impl Value {
    /// The wire tag for this value.
    pub fn tag(&self) -> Tag {
        match self {
            Self::Bytes(_) => Tag::Bytes,
            Self::Bool(_) => Tag::Bool,
            Self::Int(_) => Tag::Int,
            Self::Long(_) => Tag::Long,
            Self::String(_) => Tag::String,
            Self::Timestamp(_) => Tag::Timestamp,
            Self::List(_) => Tag::List,
            Self::Map(_) => Tag::Map,
        }
    }

    /// Human-readable kind name, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::String(_) => "string",
            Self::Timestamp(_) => "timestamp",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Timestamp> for Value {
    fn from(v: Timestamp) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Self::Map(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_bytes_roundtrip() {
        for byte in 1u8..=8 {
            let tag = Tag::try_from(byte).unwrap();
            assert_eq!(tag as u8, byte);
        }
        assert!(matches!(Tag::try_from(0), Err(CodecError::UnknownTag(0))));
        assert!(matches!(Tag::try_from(9), Err(CodecError::UnknownTag(9))));
    }

    #[test]
    fn timestamp_from_datetime_keeps_millis() {
        let dt = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let ts = Timestamp::from(dt);
        assert_eq!(ts.millis(), 1_700_000_000_123);
        assert_eq!(ts.to_datetime(), Some(dt));
    }

    #[test]
    fn timestamp_display_falls_back_to_millis() {
        assert_eq!(Timestamp::from_millis(i64::MAX).to_string(), format!("{}ms", i64::MAX));
        assert!(Timestamp::from_millis(0).to_string().starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn value_kind_matches_tag() {
        assert_eq!(Value::from(7i32).tag(), Tag::Int);
        assert_eq!(Value::from(7i64).tag(), Tag::Long);
        assert_eq!(Value::from("x").kind_name(), "string");
        assert_eq!(Value::from(Record::new()).tag(), Tag::Map);
    }

    #[test]
    fn serializes_to_plain_json() {
        let value = Value::List(vec![Value::Bool(true), Value::Long(3), "s".into()]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"[true,3,"s"]"#);
    }
}
