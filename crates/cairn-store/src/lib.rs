//! Single-node storage engine for Cairn.
//!
//! Content is identified by its BLAKE3 [`ContentHash`](cairn_types::ContentHash).
//! The engine keeps one [`ContentInfo`] record per stored hash and makes
//! every mutation crash-recoverable using nothing but files:
//!
//! - [`PartitionTable`] / [`AtomicPartitionTable`] -- fixed fan-out of
//!   per-bucket state keyed by hash prefix
//! - [`LockManager`] -- non-blocking per-hash exclusive and reader/writer
//!   locks, one mutex per bucket
//! - [`OperationJournal`] -- `pending` / `completed` / `deleted` marker
//!   directories whose membership is the state of each operation
//! - [`InfoCache`] -- lazily loaded, CAS-guarded pages over append-only
//!   per-bucket record files
//! - [`Repository`] -- the put/delete protocol over all of the above,
//!   announcing changes on the [`cairn_bus`] message bus
//!
//! # On-disk layout
//!
//! ```text
//! <root>/repository        guid record
//! <root>/pending/<hex>     put in progress
//! <root>/completed/<hex>   put committed, awaiting acknowledgement
//! <root>/deleted/<hex>     content deleted
//! <root>/info/<prefix>     ContentInfo records of one bucket
//! <root>/content/<hex>     content bytes
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod info;
pub mod journal;
pub mod lock;
pub mod message;
pub mod partition;
pub mod repository;
pub mod stream;

// Re-export primary types at crate root for ergonomic imports.
pub use backoff::{Backoff, RetryPolicy};
pub use cache::InfoCache;
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use info::ContentInfo;
pub use journal::{MarkerState, OperationJournal, Recovery};
pub use lock::LockManager;
pub use message::{ContentEvent, ContentEventKind, RepositoryMessage};
pub use partition::{AtomicPartitionTable, PartitionTable};
pub use repository::{PutOutcome, Repository, RepositoryStatus};
pub use stream::{FsStreamStore, MemoryStreamStore, StreamStore};
