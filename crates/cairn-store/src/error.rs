use cairn_bus::BusError;
use cairn_codec::CodecError;
use cairn_types::{ContentHash, TypeError};

/// Errors from storage engine operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A persisted record could not be decoded or had the wrong shape.
    #[error("malformed record: {0}")]
    Codec(#[from] CodecError),

    /// I/O error from the underlying stream store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hash or other identifier failed to parse.
    #[error("invalid identifier: {0}")]
    Type(#[from] TypeError),

    /// A `pending` marker for this hash survived from an earlier run.
    #[error("journal marker already exists for {0}")]
    MarkerExists(ContentHash),

    /// `complete` was called without a matching `begin`.
    #[error("no pending operation for {0}")]
    NotPending(ContentHash),

    /// A cache bucket could not be claimed before the retry policy gave up.
    #[error("info bucket {bucket} is contended")]
    Contended { bucket: usize },

    /// Content with this hash is unknown to the repository.
    #[error("content not found: {0}")]
    NotFound(ContentHash),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The message bus rejected a post.
    #[error("message bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Keep I/O failures from a streaming decoder classified as I/O.
    pub(crate) fn from_decode(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => Self::Io(e),
            other => Self::Codec(other),
        }
    }
}
