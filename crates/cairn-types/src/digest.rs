use std::io::{self, Write};

use crate::hash::ContentHash;

/// Streaming digest accumulator.
///
/// Content is hashed exactly once, while it is ingested: bytes written to a
/// `HashingWriter` update a BLAKE3 state and a byte counter, optionally
/// forwarding to an inner sink (the destination of the transfer). `finish`
/// yields the [`ContentHash`] and total length.
pub struct HashingWriter<W = io::Sink> {
    hasher: blake3::Hasher,
    length: u64,
    inner: W,
}

impl HashingWriter<io::Sink> {
    /// Accumulator that only hashes, discarding the bytes.
    pub fn new() -> Self {
        Self::wrap(io::sink())
    }
}

impl Default for HashingWriter<io::Sink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> HashingWriter<W> {
    /// Hash everything written while forwarding it to `inner`.
    pub fn wrap(inner: W) -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            length: 0,
            inner,
        }
    }

    /// Bytes accepted so far.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Flush the inner sink and return the digest, the length and the sink.
    pub fn finish(mut self) -> io::Result<(ContentHash, u64, W)> {
        self.inner.flush()?;
        let hash = ContentHash::from_hash(*self.hasher.finalize().as_bytes());
        Ok((hash, self.length, self.inner))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Only the bytes the sink accepted are part of the content.
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.length += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamed_hash_matches_one_shot() {
        let mut writer = HashingWriter::new();
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (hash, length, _) = writer.finish().unwrap();
        assert_eq!(hash, ContentHash::of(b"hello world"));
        assert_eq!(length, 11);
    }

    #[test]
    fn forwards_to_inner_sink() {
        let mut writer = HashingWriter::wrap(Vec::new());
        io::copy(&mut &b"payload"[..], &mut writer).unwrap();
        let (hash, length, sink) = writer.finish().unwrap();
        assert_eq!(sink, b"payload");
        assert_eq!(length, 7);
        assert_eq!(hash, ContentHash::of(b"payload"));
    }

    #[test]
    fn empty_stream_has_zero_length() {
        let (hash, length, _) = HashingWriter::new().finish().unwrap();
        assert_eq!(length, 0);
        assert_eq!(hash, ContentHash::of(b""));
    }
}
