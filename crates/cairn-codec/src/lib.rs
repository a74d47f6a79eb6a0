//! Typed record codec for Cairn.
//!
//! Every persisted structure in Cairn (journal markers, info shards, the
//! repository descriptor) is a [`Record`]: an insertion-ordered map of string
//! keys to [`Value`]s. This crate turns records into a self-delimiting binary
//! form and back.
//!
//! # Wire Format
//!
//! ```text
//! record := [u32 BE total length, header included] entry*
//! entry  := [u8 tag] [key bytes] [0x00] payload
//! ```
//!
//! | tag | kind      | payload                                   |
//! |-----|-----------|-------------------------------------------|
//! | 1   | bytes     | u32 BE length + raw bytes                 |
//! | 2   | bool      | one byte, 0 or 1                          |
//! | 3   | int       | i32 BE                                    |
//! | 4   | long      | i64 BE                                    |
//! | 5   | string    | u32 BE length + UTF-8 bytes               |
//! | 6   | timestamp | i64 BE milliseconds since the Unix epoch  |
//! | 7   | list      | u32 BE total length + (tag, payload)*     |
//! | 8   | map       | a nested record                           |
//!
//! The smallest record is four bytes long, so a zero length can never be a
//! record and marks the end of a stream.
//!
//! `decode(encode(r)) == r` holds for every record. The converse does not:
//! a decoder accepts duplicate keys, the encoder never emits them.

pub mod error;
pub mod reader;
pub mod record;
pub mod value;
pub mod wire;

pub use error::{CodecError, CodecResult};
pub use reader::{decode_all, RecordReader};
pub use record::{FromRecord, Record, ToRecord};
pub use value::{Tag, Timestamp, Value};
pub use wire::{decode, encode, write_end, write_record, END_OF_STREAM, HEADER_LEN};
