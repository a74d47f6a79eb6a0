use std::io;

/// Errors produced while encoding or decoding records.
///
/// Every decode error means the input is corrupt or truncated; none of them
/// are recovered from inside the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Input ended before a field was complete.
    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    /// A type-tag byte that does not name a known value kind.
    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),

    /// A boolean payload other than 0 or 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),

    /// A record or list length smaller than its own header.
    #[error("invalid length {0}: shorter than the 4-byte header")]
    InvalidLength(u32),

    /// A key with no NUL terminator before the end of its record.
    #[error("unterminated key")]
    UnterminatedKey,

    /// A key or string payload that is not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Bytes left over after a complete record.
    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),

    /// Keys are NUL-terminated on the wire, so they may not contain NUL.
    #[error("key contains a NUL byte: {0:?}")]
    InvalidKey(String),

    /// A record, list, string or byte payload longer than a u32 length.
    #[error("payload of {0} bytes exceeds the 4-byte length limit")]
    TooLarge(usize),

    /// A field required by a typed view of the record is absent.
    #[error("missing field `{0}`")]
    MissingField(String),

    /// A field exists but holds a different value kind.
    #[error("field `{field}` is {actual}, expected {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A field holds the right kind but an unusable value.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    /// I/O error from the byte source of a streaming decoder.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
