use std::io::{self, Read};

use crate::error::{CodecError, CodecResult};
use crate::record::Record;
use crate::wire::{decode, END_OF_STREAM, HEADER_LEN};

/// Lazy decoder over a concatenation of encoded records.
///
/// Yields one record per frame until it reads a zero length or the source
/// ends cleanly at a frame boundary. Running out of input anywhere else (in
/// the middle of a length header, or after a non-zero length) yields a
/// [`CodecError::Truncated`]. After the first error or the end of the stream
/// the iterator only returns `None`.
///
/// The caller owns the byte source; the reader never closes it.
pub struct RecordReader<R> {
    inner: R,
    done: bool,
    torn: bool,
}

/// Upper bound on the buffer reserved up front for one frame. A length
/// header is not trusted for more than this until the bytes actually arrive.
const MAX_PREALLOC: usize = 64 * 1024;

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            done: false,
            torn: false,
        }
    }

    /// Give back the byte source.
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Whether the source ended part-way through a frame.
    ///
    /// Set together with the [`CodecError::Truncated`] it caused; every
    /// record yielded before that error was complete.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    fn read_next(&mut self) -> CodecResult<Option<Record>> {
        let mut header = [0u8; HEADER_LEN];
        match fill(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            HEADER_LEN => {}
            partial => {
                self.torn = true;
                return Err(CodecError::Truncated {
                    what: "record length",
                    needed: HEADER_LEN,
                    available: partial,
                })
            }
        }

        let len = u32::from_be_bytes(header);
        if len == END_OF_STREAM {
            return Ok(None);
        }
        if (len as usize) < HEADER_LEN {
            return Err(CodecError::InvalidLength(len));
        }

        let body_len = len as usize - HEADER_LEN;
        let mut frame = Vec::with_capacity(HEADER_LEN + body_len.min(MAX_PREALLOC));
        frame.extend_from_slice(&header);
        let got = (&mut self.inner)
            .take(body_len as u64)
            .read_to_end(&mut frame)?;
        if got < body_len {
            self.torn = true;
            return Err(CodecError::Truncated {
                what: "record",
                needed: body_len,
                available: got,
            });
        }
        decode(&frame).map(Some)
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = CodecResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for RecordReader<R> {}

/// Decode every record in `bytes`. An empty slice is an empty stream.
pub fn decode_all(bytes: &[u8]) -> CodecResult<Vec<Record>> {
    RecordReader::new(bytes).collect()
}

/// Read until `buf` is full or the source is exhausted; returns bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::wire::{encode, write_end, write_record};

    fn records() -> Vec<Record> {
        vec![
            Record::new(),
            Record::new().with("a", 1i32),
            Record::new()
                .with("name", "x")
                .with("tags", vec![Value::from("t1"), Value::from("t2")])
                .with("nested", Record::new().with("deep", Record::new())),
        ]
    }

    fn stream(records: &[Record]) -> (Vec<u8>, Vec<usize>) {
        let mut out = Vec::new();
        let mut boundaries = vec![0];
        for r in records {
            write_record(&mut out, r).unwrap();
            boundaries.push(out.len());
        }
        (out, boundaries)
    }

    #[test]
    fn empty_input_is_empty_stream() {
        assert!(decode_all(&[]).unwrap().is_empty());
    }

    #[test]
    fn reads_all_records_in_order() {
        let (bytes, _) = stream(&records());
        assert_eq!(decode_all(&bytes).unwrap(), records());
    }

    #[test]
    fn stops_at_sentinel() {
        let (mut bytes, _) = stream(&records()[..1]);
        write_end(&mut bytes).unwrap();
        bytes.extend(encode(&Record::new().with("after", true)).unwrap());
        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded, vec![Record::new()]);
    }

    #[test]
    fn every_cut_between_boundaries_fails() {
        let (bytes, boundaries) = stream(&records());
        for cut in 0..=bytes.len() {
            let result = decode_all(&bytes[..cut]);
            if boundaries.contains(&cut) {
                let expected = boundaries.iter().position(|b| *b == cut).unwrap();
                assert_eq!(result.unwrap().len(), expected, "cut at {cut}");
            } else {
                assert!(result.is_err(), "cut at {cut} decoded silently");
            }
        }
    }

    #[test]
    fn partial_header_is_truncation() {
        let err = decode_all(&[0, 0]).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                what: "record length",
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn torn_tail_is_flagged() {
        let (mut bytes, _) = stream(&records()[..2]);
        let whole = bytes.len();
        bytes.extend_from_slice(&encode(&Record::new().with("late", 7i64)).unwrap()[..6]);

        let mut reader = RecordReader::new(&bytes[..]);
        assert_eq!(reader.next().unwrap().unwrap(), Record::new());
        assert!(!reader.is_torn());
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(reader.next(), Some(Err(CodecError::Truncated { .. }))));
        assert!(reader.is_torn());

        let mut clean = RecordReader::new(&bytes[..whole]);
        assert_eq!(clean.by_ref().count(), 2);
        assert!(!clean.is_torn());
    }

    #[test]
    fn corrupt_frame_is_not_torn() {
        let mut reader = RecordReader::new(&[0u8, 0, 0, 6, 9, 0][..]);
        assert!(matches!(reader.next(), Some(Err(CodecError::UnknownTag(9)))));
        assert!(!reader.is_torn());
    }

    #[test]
    fn huge_length_claim_does_not_allocate_up_front() {
        let mut bytes = 0xFFFF_FFF0u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut reader = RecordReader::new(&bytes[..]);
        match reader.next() {
            Some(Err(CodecError::Truncated {
                what: "record",
                needed,
                available: 3,
            })) => assert_eq!(needed, 0xFFFF_FFF0 - 4),
            other => panic!("unexpected {other:?}"),
        }
        assert!(reader.is_torn());
    }

    #[test]
    fn fused_after_error() {
        let mut reader = RecordReader::new(&[0u8, 0, 0, 2, 1, 2, 3][..]);
        assert!(matches!(reader.next(), Some(Err(CodecError::InvalidLength(2)))));
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn reads_from_an_io_source() {
        let (bytes, _) = stream(&records());
        let cursor = io::Cursor::new(bytes);
        let decoded: Vec<Record> = RecordReader::new(cursor)
            .collect::<CodecResult<_>>()
            .unwrap();
        assert_eq!(decoded.len(), 3);
    }
}
