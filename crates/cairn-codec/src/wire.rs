use std::io::Write;

use bytes::{Buf, BufMut};

use crate::error::{CodecError, CodecResult};
use crate::record::Record;
use crate::value::{Tag, Timestamp, Value};

/// Size of the big-endian length header that starts every record and list.
pub const HEADER_LEN: usize = 4;

/// Length value that terminates a stream of records.
pub const END_OF_STREAM: u32 = 0;

/// Encode a record into its self-delimiting binary form.
pub fn encode(record: &Record) -> CodecResult<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    put_record(&mut out, record)?;
    Ok(out)
}

/// Encode a record and write it to `w`.
pub fn write_record<W: Write>(w: &mut W, record: &Record) -> CodecResult<()> {
    let bytes = encode(record)?;
    w.write_all(&bytes)?;
    Ok(())
}

/// Write the end-of-stream sentinel.
pub fn write_end<W: Write>(w: &mut W) -> CodecResult<()> {
    w.write_all(&END_OF_STREAM.to_be_bytes())?;
    Ok(())
}

/// Decode exactly one record from `bytes`.
///
/// Fails on truncated or malformed input and on bytes left over after the
/// record.
pub fn decode(bytes: &[u8]) -> CodecResult<Record> {
    let mut buf = bytes;
    let record = get_record(&mut buf)?;
    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_record(out: &mut Vec<u8>, record: &Record) -> CodecResult<()> {
    let start = begin_frame(out);
    for (key, value) in record.iter() {
        if key.as_bytes().contains(&0) {
            return Err(CodecError::InvalidKey(key.to_string()));
        }
        out.put_u8(value.tag() as u8);
        out.put_slice(key.as_bytes());
        out.put_u8(0);
        put_payload(out, value)?;
    }
    end_frame(out, start)
}

fn put_payload(out: &mut Vec<u8>, value: &Value) -> CodecResult<()> {
    match value {
        Value::Bytes(b) => put_sized(out, b)?,
        Value::Bool(b) => out.put_u8(u8::from(*b)),
        Value::Int(i) => out.put_i32(*i),
        Value::Long(l) => out.put_i64(*l),
        Value::String(s) => put_sized(out, s.as_bytes())?,
        Value::Timestamp(t) => out.put_i64(t.millis()),
        Value::List(items) => {
            let start = begin_frame(out);
            for item in items {
                out.put_u8(item.tag() as u8);
                put_payload(out, item)?;
            }
            end_frame(out, start)?;
        }
        Value::Map(record) => put_record(out, record)?,
    }
    Ok(())
}

fn put_sized(out: &mut Vec<u8>, data: &[u8]) -> CodecResult<()> {
    let len = u32::try_from(data.len()).map_err(|_| CodecError::TooLarge(data.len()))?;
    out.put_u32(len);
    out.put_slice(data);
    Ok(())
}

/// Reserve a length header; returns its offset for [`end_frame`].
///
/// Every frame length counts its own 4-byte header as well as the body.
/// This holds for top-level records and equally for nested maps and lists,
/// so an empty record or list is `00 00 00 04`. No frame can therefore
/// have length 0, which leaves that value free for [`END_OF_STREAM`].
fn begin_frame(out: &mut Vec<u8>) -> usize {
    let start = out.len();
    out.put_u32(0);
    start
}

/// Patch the header at `start` with the frame length, header included.
fn end_frame(out: &mut [u8], start: usize) -> CodecResult<()> {
    let total = out.len() - start;
    let len = u32::try_from(total).map_err(|_| CodecError::TooLarge(total))?;
    out[start..start + HEADER_LEN].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn ensure(buf: &[u8], needed: usize, what: &'static str) -> CodecResult<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            what,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Split one length-prefixed frame off `buf`, returning its body.
fn get_frame<'a>(buf: &mut &'a [u8], what: &'static str) -> CodecResult<&'a [u8]> {
    ensure(buf, HEADER_LEN, what)?;
    let len = buf.get_u32();
    if (len as usize) < HEADER_LEN {
        return Err(CodecError::InvalidLength(len));
    }
    let body_len = len as usize - HEADER_LEN;
    ensure(buf, body_len, what)?;
    let data: &'a [u8] = *buf;
    let (body, rest) = data.split_at(body_len);
    *buf = rest;
    Ok(body)
}

fn get_record(buf: &mut &[u8]) -> CodecResult<Record> {
    let mut body = get_frame(buf, "record")?;
    let mut record = Record::new();
    while body.has_remaining() {
        let tag = Tag::try_from(body.get_u8())?;
        let key = get_key(&mut body)?;
        let value = get_payload(&mut body, tag)?;
        record.insert(key, value);
    }
    Ok(record)
}

fn get_key(buf: &mut &[u8]) -> CodecResult<String> {
    let nul = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(CodecError::UnterminatedKey)?;
    let key = std::str::from_utf8(&buf[..nul])
        .map_err(|_| CodecError::InvalidUtf8("key"))?
        .to_string();
    buf.advance(nul + 1);
    Ok(key)
}

fn get_payload(buf: &mut &[u8], tag: Tag) -> CodecResult<Value> {
    let value = match tag {
        Tag::Bytes => Value::Bytes(get_sized(buf, "bytes")?.to_vec()),
        Tag::Bool => {
            ensure(buf, 1, "bool")?;
            match buf.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(CodecError::InvalidBool(other)),
            }
        }
        Tag::Int => {
            ensure(buf, 4, "int")?;
            Value::Int(buf.get_i32())
        }
        Tag::Long => {
            ensure(buf, 8, "long")?;
            Value::Long(buf.get_i64())
        }
        Tag::String => {
            let raw = get_sized(buf, "string")?;
            let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8("string"))?;
            Value::String(s.to_string())
        }
        Tag::Timestamp => {
            ensure(buf, 8, "timestamp")?;
            Value::Timestamp(Timestamp::from_millis(buf.get_i64()))
        }
        Tag::List => {
            let mut body = get_frame(buf, "list")?;
            let mut items = Vec::new();
            while body.has_remaining() {
                let tag = Tag::try_from(body.get_u8())?;
                items.push(get_payload(&mut body, tag)?);
            }
            Value::List(items)
        }
        Tag::Map => Value::Map(get_record(buf)?),
    };
    Ok(value)
}

fn get_sized<'a>(buf: &mut &'a [u8], what: &'static str) -> CodecResult<&'a [u8]> {
    ensure(buf, 4, what)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len, what)?;
    let all: &'a [u8] = *buf;
    let (data, rest) = all.split_at(len);
    *buf = rest;
    Ok(data)
}
