//! Foundation types for Cairn.
//!
//! Every other Cairn crate depends on `cairn-types`. It defines the identity
//! of stored content and the accumulator that produces it.
//!
//! # Key Types
//!
//! - [`ContentHash`]: BLAKE3 digest identifying a piece of content
//! - [`HashingWriter`]: `io::Write` sink that hashes and counts streamed bytes

pub mod digest;
pub mod error;
pub mod hash;

pub use digest::HashingWriter;
pub use error::TypeError;
pub use hash::{ContentHash, HASH_LEN};
