//! Variable-length integers used by the V2 framing.
//!
//! The two low bits of the first byte give the encoded length
//! (`0b00` = 1 byte, `0b01` = 2, `0b10` = 4, `0b11` = 8); the remaining bits
//! hold the value, little-endian. Values up to 2^62 - 1 are representable.

use bytes::BufMut;

use crate::error::{Result, RpcError};

/// Largest encodable value.
pub const VARINT_MAX: u64 = (1 << 62) - 1;

/// Longest possible encoding.
pub const VARINT_MAX_LEN: usize = 8;

/// Number of bytes needed to encode `value`.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    if value < (1 << 6) {
        1
    } else if value < (1 << 14) {
        2
    } else if value < (1 << 30) {
        4
    } else {
        8
    }
}

/// Length of a varint given its first byte.
#[inline]
pub fn decoded_len(first: u8) -> usize {
    1 << (first & 0b11)
}

/// Append `value` to `buf`.
pub fn put_varint<B: BufMut>(buf: &mut B, value: u64) -> Result<()> {
    if value > VARINT_MAX {
        return Err(RpcError::Protocol(format!(
            "varint value {} exceeds maximum {}",
            value, VARINT_MAX
        )));
    }
    match encoded_len(value) {
        1 => buf.put_u8((value << 2) as u8),
        2 => buf.put_u16_le(((value << 2) | 0b01) as u16),
        4 => buf.put_u32_le(((value << 2) | 0b10) as u32),
        _ => buf.put_u64_le((value << 2) | 0b11),
    }
    Ok(())
}

/// Decode a varint from the start of `buf`.
///
/// Returns `None` if `buf` does not yet hold the whole encoding, otherwise the
/// value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = decoded_len(first);
    if buf.len() < len {
        return None;
    }
    let mut raw = [0u8; 8];
    raw[..len].copy_from_slice(&buf[..len]);
    Some((u64::from_le_bytes(raw) >> 2, len))
}

/// Read a varint from a cursor, failing if the buffer is truncated.
pub fn read_varint(buf: &mut &[u8]) -> Result<u64> {
    let (value, len) = decode_varint(buf)
        .ok_or_else(|| RpcError::Protocol("truncated varint".to_string()))?;
    *buf = &buf[len..];
    Ok(value)
}
