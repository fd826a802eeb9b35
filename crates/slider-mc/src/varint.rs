//! `VarInt` encoding/decoding for Minecraft protocol.
//!
//! Minecraft uses a variable-length integer encoding where each byte
//! uses 7 bits for data and 1 bit to indicate if more bytes follow.

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};

/// Segment bits mask (lower 7 bits).
const SEGMENT_BITS: u8 = 0x7F;

/// Continue bit (high bit).
const CONTINUE_BIT: u8 = 0x80;

/// Maximum encoded size of a `VarInt`.
pub const MAX_VARINT_LEN: usize = 5;

/// Read a `VarInt` from a buffer, advancing it.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedVarInt`] if the `VarInt` is longer than
/// 5 bytes, or [`ProtocolError::UnexpectedEof`] if the buffer ends first.
pub fn read_varint(buf: &mut impl Buf) -> Result<i32> {
    let mut value: i32 = 0;
    let mut position: u32 = 0;

    loop {
        if !buf.has_remaining() {
            return Err(ProtocolError::UnexpectedEof {
                needed: 1,
                remaining: 0,
            });
        }

        let byte = buf.get_u8();
        value |= i32::from(byte & SEGMENT_BITS) << position;

        if byte & CONTINUE_BIT == 0 {
            return Ok(value);
        }

        position += 7;
        if position >= 32 {
            return Err(ProtocolError::MalformedVarInt);
        }
    }
}

/// Decode a `VarInt` at the start of `bytes` without consuming anything.
///
/// Returns `Ok(None)` when `bytes` ends before the `VarInt` does, otherwise
/// the value and the number of bytes it occupies.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedVarInt`] if the `VarInt` is longer than 5 bytes.
pub fn peek_varint(bytes: &[u8]) -> Result<Option<(i32, usize)>> {
    let mut value: i32 = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(ProtocolError::MalformedVarInt);
        }

        #[allow(clippy::cast_possible_truncation)]
        let shift = (7 * i) as u32;
        value |= i32::from(byte & SEGMENT_BITS) << shift;

        if byte & CONTINUE_BIT == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if bytes.len() >= MAX_VARINT_LEN {
        return Err(ProtocolError::MalformedVarInt);
    }

    Ok(None)
}

/// Write a `VarInt` to a buffer.
#[allow(clippy::cast_sign_loss)]
pub fn write_varint(buf: &mut impl BufMut, value: i32) {
    let mut value = value as u32;

    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & u32::from(SEGMENT_BITS)) as u8;
        value >>= 7;

        if value == 0 {
            buf.put_u8(byte);
            break;
        }

        buf.put_u8(byte | CONTINUE_BIT);
    }
}

/// Calculate the number of bytes needed to encode a `VarInt`.
#[must_use]
#[allow(clippy::cast_sign_loss)]
pub const fn varint_len(value: i32) -> usize {
    // Convert to unsigned for bit manipulation
    let value = value as u32;

    if value == 0 {
        return 1;
    }

    // Calculate the number of 7-bit segments needed
    let bits_needed = 32 - value.leading_zeros();
    (bits_needed as usize).div_ceil(7)
}
