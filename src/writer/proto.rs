//! Protocol-buffer wire encoding, crash-path flavored.
//!
//! Plain varint/tag-length-value encoding against a [`ProtoSink`]. Nested
//! message lengths are computed with a dry run against [`Measure`] before
//! the real bytes are emitted, so no intermediate buffers are needed and
//! nothing allocates.

use crate::error::Error;

pub const WIRE_VARINT: u32 = 0;
pub const WIRE_LEN: u32 = 2;

pub trait ProtoSink {
    fn push(&mut self, bytes: &[u8]) -> Result<(), Error>;
}

/// A sink that only counts. Used for the sizing pass.
pub struct Measure(pub usize);

impl ProtoSink for Measure {
    fn push(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.0 += bytes.len();
        Ok(())
    }
}

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn put_varint<S: ProtoSink + ?Sized>(sink: &mut S, mut value: u64) -> Result<usize, Error> {
    let mut buf = [0u8; 10];
    let mut len = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[len] = byte;
            len += 1;
            break;
        }
        buf[len] = byte | 0x80;
        len += 1;
    }
    sink.push(&buf[..len])?;
    Ok(len)
}

pub fn put_key<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    wire_type: u32,
) -> Result<usize, Error> {
    put_varint(sink, ((field << 3) | wire_type) as u64)
}

pub fn put_u64<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    value: u64,
) -> Result<usize, Error> {
    Ok(put_key(sink, field, WIRE_VARINT)? + put_varint(sink, value)?)
}

pub fn put_u32<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    value: u32,
) -> Result<usize, Error> {
    put_u64(sink, field, value as u64)
}

pub fn put_bool<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    value: bool,
) -> Result<usize, Error> {
    put_u64(sink, field, value as u64)
}

pub fn put_bytes<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    bytes: &[u8],
) -> Result<usize, Error> {
    let mut n = put_key(sink, field, WIRE_LEN)?;
    n += put_varint(sink, bytes.len() as u64)?;
    sink.push(bytes)?;
    Ok(n + bytes.len())
}

pub fn put_str<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    value: &str,
) -> Result<usize, Error> {
    put_bytes(sink, field, value.as_bytes())
}

/// Emit the key and length prefix for a nested message whose body is
/// `body_len` bytes (previously computed against [`Measure`]).
pub fn put_message_header<S: ProtoSink + ?Sized>(
    sink: &mut S,
    field: u32,
    body_len: usize,
) -> Result<usize, Error> {
    Ok(put_key(sink, field, WIRE_LEN)? + put_varint(sink, body_len as u64)?)
}
