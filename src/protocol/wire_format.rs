//! Wire format encoding and decoding.
//!
//! Two frame layouts are supported.
//!
//! V1 (legacy, one request per stream), fixed 14-byte header:
//! ```text
//! ┌──────────┬───────────┬───────────┬──────┬─────────────┬──────────┐
//! │ Magic    │ Protocol  │ Encoding  │ Type │ Compression │ Size     │
//! │ "IceP"   │ 1.0       │ 1.0       │ u8   │ u8          │ i32 LE   │
//! │ 4 bytes  │ 2 bytes   │ 2 bytes   │      │             │ 4 bytes  │
//! └──────────┴───────────┴───────────┴──────┴─────────────┴──────────┘
//! ```
//! The size field is the total frame length, header included.
//!
//! V2 (multiplexed):
//! ```text
//! ┌──────┬──────────────────┬──────────┐
//! │ Type │ Body size        │ Body     │
//! │ u8   │ varint (1-8 B)   │          │
//! └──────┴──────────────────┴──────────┘
//! ```

use bytes::{BufMut, BytesMut};
use serde::Deserialize;

use super::varint::{decode_varint, decoded_len};
use crate::error::{Result, RpcError};

/// V1 magic bytes.
pub const V1_MAGIC: [u8; 4] = *b"IceP";

/// V1 header size in bytes (fixed, exactly 14).
pub const V1_HEADER_SIZE: usize = 14;

/// Offset of the compression status byte in a V1 header.
pub const V1_COMPRESSION_OFFSET: usize = 9;

/// Offset of the size field in a V1 header.
pub const V1_SIZE_OFFSET: usize = 10;

/// V1 protocol version (major, minor).
pub const V1_PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// V1 encoding version (major, minor).
pub const V1_ENCODING_VERSION: (u8, u8) = (1, 0);

/// Size of the V2 placeholder written before the body length is known:
/// the type byte plus a 4-byte varint.
pub const V2_PLACEHOLDER_HEADER_SIZE: usize = 5;

/// Longest possible V2 header.
pub const V2_MAX_HEADER_SIZE: usize = 9;

/// Largest body a patched 4-byte V2 size field can describe.
pub const V2_MAX_PATCHED_BODY: usize = (1 << 30) - 1;

/// V2 protocol version carried by the Initialize frame.
pub const V2_PROTOCOL_VERSION: u64 = 1;

/// Default maximum frame size (1 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Pre-built V1 ValidateConnection frame.
pub const VALIDATE_CONNECTION_FRAME: [u8; V1_HEADER_SIZE] = [
    b'I', b'c', b'e', b'P', 1, 0, 1, 0, 3, 0, V1_HEADER_SIZE as u8, 0, 0, 0,
];

/// Pre-built V1 CloseConnection frame.
pub const CLOSE_CONNECTION_FRAME: [u8; V1_HEADER_SIZE] = [
    b'I', b'c', b'e', b'P', 1, 0, 1, 0, 4, 0, V1_HEADER_SIZE as u8, 0, 0, 0,
];

/// Protocol family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Protocol {
    /// Legacy protocol: one request per stream, 32-bit request ids.
    #[serde(rename = "1")]
    V1,
    /// Multiplexed protocol with explicit stream ids.
    #[serde(rename = "2")]
    V2,
}

impl Protocol {
    /// Smallest number of bytes needed before the header can be inspected.
    #[inline]
    pub fn min_header_size(self) -> usize {
        match self {
            Protocol::V1 => V1_HEADER_SIZE,
            Protocol::V2 => 2,
        }
    }

    /// Whether this protocol can reset a single stream.
    #[inline]
    pub fn supports_stream_reset(self) -> bool {
        matches!(self, Protocol::V2)
    }

    /// Protocol number as written in endpoint strings.
    pub fn as_u8(self) -> u8 {
        match self {
            Protocol::V1 => 1,
            Protocol::V2 => 2,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Logical frame type, shared by both protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// V2 Initialize / V1 ValidateConnection.
    Initialize,
    /// V2 GoAway / V1 CloseConnection.
    GoAway,
    /// Request on a stream.
    Request,
    /// V1 batch of requests (parsed, never processed).
    RequestBatch,
    /// V2 Response / V1 Reply.
    Response,
    /// V2 keep-alive probe.
    Ping,
    /// V2 keep-alive answer.
    Pong,
    /// V2 per-stream reset.
    ResetStream,
}

impl FrameType {
    /// Human-readable name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Initialize => "Initialize",
            FrameType::GoAway => "GoAway",
            FrameType::Request => "Request",
            FrameType::RequestBatch => "RequestBatch",
            FrameType::Response => "Response",
            FrameType::Ping => "Ping",
            FrameType::Pong => "Pong",
            FrameType::ResetStream => "ResetStream",
        }
    }

    /// Wire value of this frame type for `protocol`.
    pub fn to_wire(self, protocol: Protocol) -> Result<u8> {
        let value = match (protocol, self) {
            (Protocol::V1, FrameType::Request) => 0,
            (Protocol::V1, FrameType::RequestBatch) => 1,
            (Protocol::V1, FrameType::Response) => 2,
            (Protocol::V1, FrameType::Initialize) => 3,
            (Protocol::V1, FrameType::GoAway) => 4,
            (Protocol::V1, other) => {
                return Err(RpcError::NotSupported(format!(
                    "{} frames are not part of protocol 1",
                    other.as_str()
                )))
            }
            (Protocol::V2, FrameType::Initialize) => 1,
            (Protocol::V2, FrameType::GoAway) => 2,
            (Protocol::V2, FrameType::Request) => 3,
            (Protocol::V2, FrameType::Response) => 4,
            (Protocol::V2, FrameType::Ping) => 5,
            (Protocol::V2, FrameType::Pong) => 6,
            (Protocol::V2, FrameType::ResetStream) => 7,
            (Protocol::V2, FrameType::RequestBatch) => {
                return Err(RpcError::NotSupported(
                    "batch requests are not part of protocol 2".to_string(),
                ))
            }
        };
        Ok(value)
    }

    /// Decode a wire value for `protocol`.
    pub fn from_wire(protocol: Protocol, value: u8) -> Result<Self> {
        let frame_type = match (protocol, value) {
            (Protocol::V1, 0) => FrameType::Request,
            (Protocol::V1, 1) => FrameType::RequestBatch,
            (Protocol::V1, 2) => FrameType::Response,
            (Protocol::V1, 3) => FrameType::Initialize,
            (Protocol::V1, 4) => FrameType::GoAway,
            (Protocol::V2, 1) => FrameType::Initialize,
            (Protocol::V2, 2) => FrameType::GoAway,
            (Protocol::V2, 3) => FrameType::Request,
            (Protocol::V2, 4) => FrameType::Response,
            (Protocol::V2, 5) => FrameType::Ping,
            (Protocol::V2, 6) => FrameType::Pong,
            (Protocol::V2, 7) => FrameType::ResetStream,
            (protocol, value) => {
                return Err(RpcError::Protocol(format!(
                    "unknown frame type {} for protocol {}",
                    value, protocol
                )))
            }
        };
        Ok(frame_type)
    }

    /// Whether frames of this type carry request or response data.
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, FrameType::Request | FrameType::Response)
    }
}

/// Compression status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionStatus {
    /// Not compressed; the response must not be compressed either.
    #[default]
    NotCompressed = 0,
    /// Not compressed; the sender accepts a compressed response.
    CompressResponse = 1,
    /// The body is compressed.
    Compressed = 2,
}

impl TryFrom<u8> for CompressionStatus {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CompressionStatus::NotCompressed),
            1 => Ok(CompressionStatus::CompressResponse),
            2 => Ok(CompressionStatus::Compressed),
            other => Err(RpcError::Protocol(format!(
                "invalid compression status {}",
                other
            ))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol the header was read with.
    pub protocol: Protocol,
    /// Frame type.
    pub frame_type: FrameType,
    /// Compression status (V1 only; V2 carries it in the body).
    pub compression: CompressionStatus,
    /// Encoded header length.
    pub header_len: usize,
    /// Body length (frame length minus header).
    pub body_len: usize,
}

impl Header {
    /// Total frame length.
    #[inline]
    pub fn frame_len(&self) -> usize {
        self.header_len + self.body_len
    }
}

/// Write a header placeholder; the size is filled in by [`patch_size`].
pub fn write_header(buf: &mut BytesMut, frame_type: FrameType, protocol: Protocol) -> Result<()> {
    let wire_type = frame_type.to_wire(protocol)?;
    match protocol {
        Protocol::V1 => {
            buf.put_slice(&V1_MAGIC);
            buf.put_u8(V1_PROTOCOL_VERSION.0);
            buf.put_u8(V1_PROTOCOL_VERSION.1);
            buf.put_u8(V1_ENCODING_VERSION.0);
            buf.put_u8(V1_ENCODING_VERSION.1);
            buf.put_u8(wire_type);
            buf.put_u8(CompressionStatus::NotCompressed as u8);
            buf.put_i32_le(0);
        }
        Protocol::V2 => {
            buf.put_u8(wire_type);
            buf.put_u32_le(0b10);
        }
    }
    Ok(())
}

/// Header length written by [`write_header`].
#[inline]
pub fn placeholder_header_len(protocol: Protocol) -> usize {
    match protocol {
        Protocol::V1 => V1_HEADER_SIZE,
        Protocol::V2 => V2_PLACEHOLDER_HEADER_SIZE,
    }
}

/// Patch the size field of a frame built with [`write_header`].
pub fn patch_size(frame: &mut [u8], protocol: Protocol) -> Result<()> {
    match protocol {
        Protocol::V1 => {
            let total = i32::try_from(frame.len()).map_err(|_| RpcError::FrameTooLarge {
                size: frame.len(),
                max: i32::MAX as usize,
            })?;
            write_size(frame, total);
        }
        Protocol::V2 => {
            let body = frame.len() - V2_PLACEHOLDER_HEADER_SIZE;
            if body > V2_MAX_PATCHED_BODY {
                return Err(RpcError::FrameTooLarge {
                    size: body,
                    max: V2_MAX_PATCHED_BODY,
                });
            }
            let encoded = ((body as u32) << 2) | 0b10;
            frame[1..V2_PLACEHOLDER_HEADER_SIZE].copy_from_slice(&encoded.to_le_bytes());
        }
    }
    Ok(())
}

/// Write the V1 size field.
#[inline]
pub fn write_size(header: &mut [u8], size: i32) {
    header[V1_SIZE_OFFSET..V1_SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());
}

/// Read the V1 size field.
#[inline]
pub fn read_size(header: &[u8]) -> i32 {
    i32::from_le_bytes([
        header[V1_SIZE_OFFSET],
        header[V1_SIZE_OFFSET + 1],
        header[V1_SIZE_OFFSET + 2],
        header[V1_SIZE_OFFSET + 3],
    ])
}

/// Validate V1 magic and major versions.
pub fn check_header(header: &[u8]) -> Result<()> {
    if header.len() < V1_HEADER_SIZE {
        return Err(RpcError::Protocol(format!(
            "header too short: {} bytes, expected {}",
            header.len(),
            V1_HEADER_SIZE
        )));
    }
    if header[0..4] != V1_MAGIC {
        return Err(RpcError::Protocol(format!(
            "bad magic {:02x?}",
            &header[0..4]
        )));
    }
    if header[4] != V1_PROTOCOL_VERSION.0 {
        return Err(RpcError::Protocol(format!(
            "unsupported protocol version {}.{}",
            header[4], header[5]
        )));
    }
    if header[6] != V1_ENCODING_VERSION.0 {
        return Err(RpcError::Protocol(format!(
            "unsupported encoding version {}.{}",
            header[6], header[7]
        )));
    }
    Ok(())
}

/// Decode a header from the start of `buf`.
///
/// Returns `Ok(None)` if more bytes are needed.
pub fn decode_header(buf: &[u8], protocol: Protocol) -> Result<Option<Header>> {
    match protocol {
        Protocol::V1 => {
            if buf.len() < V1_HEADER_SIZE {
                return Ok(None);
            }
            check_header(buf)?;
            let frame_type = FrameType::from_wire(protocol, buf[8])?;
            let compression = CompressionStatus::try_from(buf[V1_COMPRESSION_OFFSET])?;
            let size = read_size(buf);
            if size < V1_HEADER_SIZE as i32 {
                return Err(RpcError::Protocol(format!("invalid frame size {}", size)));
            }
            Ok(Some(Header {
                protocol,
                frame_type,
                compression,
                header_len: V1_HEADER_SIZE,
                body_len: size as usize - V1_HEADER_SIZE,
            }))
        }
        Protocol::V2 => {
            let Some(&first) = buf.first() else {
                return Ok(None);
            };
            let frame_type = FrameType::from_wire(protocol, first)?;
            let Some(&size_first) = buf.get(1) else {
                return Ok(None);
            };
            let size_len = decoded_len(size_first);
            let Some((body_len, _)) = decode_varint(&buf[1..]) else {
                return Ok(None);
            };
            let body_len = usize::try_from(body_len).map_err(|_| {
                RpcError::Protocol(format!("frame body size {} does not fit in memory", body_len))
            })?;
            Ok(Some(Header {
                protocol,
                frame_type,
                compression: CompressionStatus::NotCompressed,
                header_len: 1 + size_len,
                body_len,
            }))
        }
    }
}
