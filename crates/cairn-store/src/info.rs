use cairn_codec::{encode, CodecError, CodecResult, FromRecord, Record, ToRecord};
use cairn_types::ContentHash;
use serde::Serialize;

/// Persisted metadata for one content item.
///
/// Created on the first successful put of its hash and never changed
/// afterwards; a delete removes it outright.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentInfo {
    pub hash: ContentHash,
    /// Content size in bytes.
    pub length: u64,
    pub metadata: Record,
}

impl ContentInfo {
    pub fn new(hash: ContentHash, length: u64) -> Self {
        Self {
            hash,
            length,
            metadata: Record::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Record) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record form for persisting. Fails if `length` does not fit the
    /// signed 64-bit wire field.
    pub fn checked_record(&self) -> CodecResult<Record> {
        let length = i64::try_from(self.length).map_err(|_| CodecError::InvalidField {
            field: "length".to_string(),
            reason: format!("{} exceeds the largest storable length", self.length),
        })?;
        Ok(self.record_with_length(length))
    }

    /// Encoded bytes of [`checked_record`](Self::checked_record).
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(&self.checked_record()?)
    }

    fn record_with_length(&self, length: i64) -> Record {
        Record::new()
            .with("hash", self.hash.to_hex())
            .with("length", length)
            .with("metadata", self.metadata.clone())
    }
}

/// Display form. Lengths beyond `i64::MAX` saturate; nothing written to
/// disk goes through here.
impl ToRecord for ContentInfo {
    fn to_record(&self) -> Record {
        self.record_with_length(i64::try_from(self.length).unwrap_or(i64::MAX))
    }
}

impl FromRecord for ContentInfo {
    fn from_record(record: &Record) -> CodecResult<Self> {
        let hex = record.str("hash")?;
        let hash = ContentHash::from_hex(hex).map_err(|e| CodecError::InvalidField {
            field: "hash".to_string(),
            reason: e.to_string(),
        })?;
        let length = u64::try_from(record.long("length")?).map_err(|_| CodecError::InvalidField {
            field: "length".to_string(),
            reason: "negative length".to_string(),
        })?;
        let metadata = match record.get("metadata") {
            Some(_) => record.map("metadata")?.clone(),
            None => Record::new(),
        };
        Ok(Self {
            hash,
            length,
            metadata,
        })
    }
}
