//! Field-level helpers for reading and writing packet bodies.
//!
//! Every read is bounds-checked: a short body yields
//! [`ProtocolError::UnexpectedEof`] rather than a panic.

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::varint::{read_varint, write_varint};

/// Fail with [`ProtocolError::UnexpectedEof`] unless `buf` holds `needed` bytes.
///
/// # Errors
///
/// Returns an error if fewer than `needed` bytes remain.
pub fn ensure_remaining(buf: &impl Buf, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::UnexpectedEof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Read a Minecraft string from a buffer.
///
/// Minecraft strings are: `[VarInt length][UTF-8 bytes]`
///
/// # Errors
///
/// Returns an error if the string exceeds the maximum length, is truncated,
/// or is not valid UTF-8.
pub fn read_string(buf: &mut impl Buf, max_len: usize) -> Result<String> {
    let len = read_varint(buf)?;

    // Max 4 bytes per char in UTF-8
    let max_bytes = max_len * 4;
    let len = usize::try_from(len).map_err(|_| ProtocolError::StringTooLong {
        len: 0,
        max: max_bytes,
    })?;

    if len > max_bytes {
        return Err(ProtocolError::StringTooLong {
            len,
            max: max_bytes,
        });
    }

    ensure_remaining(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);

    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidData("string is not UTF-8"))
}

/// Write a Minecraft string to a buffer.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn write_string(buf: &mut impl BufMut, s: &str) {
    let bytes = s.as_bytes();
    write_varint(buf, bytes.len() as i32);
    buf.put_slice(bytes);
}

/// Read a length-prefixed byte array.
///
/// # Errors
///
/// Returns an error if the array is longer than `max_len` or truncated.
pub fn read_byte_array(buf: &mut impl Buf, max_len: usize) -> Result<Bytes> {
    let len = read_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::StringTooLong {
        len: 0,
        max: max_len,
    })?;

    if len > max_len {
        return Err(ProtocolError::StringTooLong { len, max: max_len });
    }

    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Write a length-prefixed byte array.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn write_byte_array(buf: &mut impl BufMut, data: &[u8]) {
    write_varint(buf, data.len() as i32);
    buf.put_slice(data);
}

/// Read a UUID (two big-endian longs).
///
/// # Errors
///
/// Returns an error if fewer than 16 bytes remain.
pub fn read_uuid(buf: &mut impl Buf) -> Result<Uuid> {
    ensure_remaining(buf, 16)?;
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

/// Write a UUID.
pub fn write_uuid(buf: &mut impl BufMut, uuid: Uuid) {
    buf.put_slice(uuid.as_bytes());
}

/// Read a boolean byte.
///
/// # Errors
///
/// Returns an error if the buffer is empty.
pub fn read_bool(buf: &mut impl Buf) -> Result<bool> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8() != 0)
}

/// Read a single unsigned byte.
///
/// # Errors
///
/// Returns an error if the buffer is empty.
pub fn read_u8(buf: &mut impl Buf) -> Result<u8> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

/// Read a big-endian `u16`.
///
/// # Errors
///
/// Returns an error if fewer than 2 bytes remain.
pub fn read_u16(buf: &mut impl Buf) -> Result<u16> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

/// Read a big-endian `i64`.
///
/// # Errors
///
/// Returns an error if fewer than 8 bytes remain.
pub fn read_i64(buf: &mut impl Buf) -> Result<i64> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_i64())
}

/// NBT tag type of a string.
const TAG_STRING: u8 = 0x08;

/// Append one UTF-16 code unit in Java's modified UTF-8.
#[allow(clippy::cast_possible_truncation)]
fn push_mutf8_unit(out: &mut Vec<u8>, unit: u16) {
    match unit {
        0x0001..=0x007F => out.push(unit as u8),
        0x0000 | 0x0080..=0x07FF => {
            out.push(0xC0 | (unit >> 6) as u8);
            out.push(0x80 | (unit & 0x3F) as u8);
        }
        _ => {
            out.push(0xE0 | (unit >> 12) as u8);
            out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
            out.push(0x80 | (unit & 0x3F) as u8);
        }
    }
}

/// Encode `text` as modified UTF-8, stopping before the first character that
/// would take the output past `limit` bytes.
///
/// NUL becomes `C0 80` and characters outside the BMP become two 3-byte
/// surrogates, the way `DataOutput::writeUTF` writes them.
fn encode_mutf8(text: &str, limit: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len().min(limit));
    let mut units = [0u16; 2];
    for c in text.chars() {
        let start = out.len();
        for &unit in c.encode_utf16(&mut units).iter() {
            push_mutf8_unit(&mut out, unit);
        }
        if out.len() > limit {
            out.truncate(start);
            break;
        }
    }
    out
}

/// Decode modified UTF-8.
fn decode_mutf8(bytes: &[u8]) -> Result<String> {
    const BAD: ProtocolError = ProtocolError::InvalidData("text component is not modified UTF-8");

    let continuation = |b: Option<&u8>| match b {
        Some(&b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
        _ => Err(BAD),
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        let unit = match b {
            0x01..=0x7F => u16::from(b),
            0xC0..=0xDF => (u16::from(b & 0x1F) << 6) | continuation(iter.next())?,
            0xE0..=0xEF => {
                let high = continuation(iter.next())?;
                (u16::from(b & 0x0F) << 12) | (high << 6) | continuation(iter.next())?
            }
            _ => return Err(BAD),
        };
        units.push(unit);
    }

    String::from_utf16(&units).map_err(|_| BAD)
}

/// Write a plain text component in network NBT form (a bare string tag).
///
/// The string is modified UTF-8, as NBT requires. Text longer than an NBT
/// string allows is cut at a character boundary.
pub fn write_text_component(buf: &mut impl BufMut, text: &str) {
    let encoded = encode_mutf8(text, usize::from(u16::MAX));

    buf.put_u8(TAG_STRING);
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u16(encoded.len() as u16);
    buf.put_slice(&encoded);
}

/// Read a text component written as a bare NBT string tag.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedNbt`] for any other tag type and
/// [`ProtocolError::InvalidData`] if the string is not modified UTF-8.
pub fn read_text_component(buf: &mut impl Buf) -> Result<String> {
    ensure_remaining(buf, 1)?;
    let tag = buf.get_u8();
    if tag != TAG_STRING {
        return Err(ProtocolError::UnsupportedNbt(tag));
    }

    let len = usize::from(read_u16(buf)?);
    ensure_remaining(buf, len)?;
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);

    decode_mutf8(&bytes)
}
