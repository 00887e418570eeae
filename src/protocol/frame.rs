//! Frame types and body encoding.
//!
//! [`RawFrame`] is what the frame buffer produces: a validated header plus the
//! body bytes, possibly compressed. [`decode_frame`] turns it into a
//! [`DecodedFrame`] the connection can route; the `encode_*` functions build
//! complete outgoing frames.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use rpcmux::codec::CompressionSettings;
//! use rpcmux::protocol::{decode_frame, encode_data_frame, DecodedFrame, FrameBuffer,
//!     FrameType, Protocol, StreamRef};
//!
//! let settings = CompressionSettings::default();
//! let bytes = encode_data_frame(Protocol::V2, FrameType::Request, StreamRef::Id(4),
//!     true, b"hello", false, &settings).unwrap();
//!
//! let mut buffer = FrameBuffer::new(Protocol::V2);
//! let raw = buffer.push(&bytes).unwrap().remove(0);
//! match decode_frame(raw, &settings, 16 * 1024).unwrap() {
//!     DecodedFrame::Data { stream, frame, fin } => {
//!         assert_eq!(stream, StreamRef::Id(4));
//!         assert_eq!(frame.payload(), b"hello");
//!         assert!(fin);
//!     }
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::varint::{put_varint, read_varint};
use super::wire_format::{
    patch_size, placeholder_header_len, write_header, CompressionStatus, FrameType, Header,
    Protocol, CLOSE_CONNECTION_FRAME, V1_COMPRESSION_OFFSET, V1_HEADER_SIZE,
    VALIDATE_CONNECTION_FRAME,
};
use crate::codec::{compress_body, decompress_body, Compressed, CompressionSettings};
use crate::error::{Result, RpcError};

/// Pre-built V2 Ping frame (empty body).
pub const V2_PING_FRAME: [u8; 2] = [5, 0];

/// Pre-built V2 Pong frame (empty body).
pub const V2_PONG_FRAME: [u8; 2] = [6, 0];

/// V2 data frame flag: last frame of this direction.
const FLAG_FIN: u8 = 0b0000_0001;

/// A header plus its (possibly compressed) body.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Decoded header.
    pub header: Header,
    /// Body bytes following the header.
    pub body: Bytes,
}

/// A request or response frame as seen by a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Compression status the frame was received with.
    pub compression: CompressionStatus,
    /// Application payload (already decompressed).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new uncompressed frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            compression: CompressionStatus::NotCompressed,
            payload,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether the sender accepts a compressed answer.
    #[inline]
    pub fn wants_compressed_response(&self) -> bool {
        self.compression != CompressionStatus::NotCompressed
    }
}

/// How a data frame names its stream on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRef {
    /// V2 explicit stream id.
    Id(u64),
    /// V1 request id (0 = oneway).
    RequestId(i32),
}

/// Parameters exchanged by the V2 Initialize frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitializeParams {
    /// Protocol version.
    pub version: u64,
    /// Largest frame the sender accepts.
    pub max_frame_size: u64,
    /// Sender's idle timeout in milliseconds (0 = none).
    pub idle_timeout_ms: u64,
}

/// GoAway payload.
///
/// Last ids are encoded as `id + 1`, with 0 meaning that no stream of that
/// kind was processed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoAwayParams {
    /// Highest peer-initiated bidirectional stream processed.
    pub last_bidirectional: Option<u64>,
    /// Highest peer-initiated unidirectional stream processed.
    pub last_unidirectional: Option<u64>,
    /// Human-readable reason.
    pub reason: String,
}

/// A frame decoded far enough to be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// Request or response data for a stream.
    Data {
        /// Target stream.
        stream: StreamRef,
        /// The frame.
        frame: Frame,
        /// Last frame in this direction.
        fin: bool,
    },
    /// V2 Initialize or V1 ValidateConnection.
    Initialize {
        /// Control stream id (V2 only).
        stream_id: Option<u64>,
        /// Handshake parameters (V2 only).
        params: Option<InitializeParams>,
    },
    /// V2 GoAway or V1 CloseConnection.
    GoAway {
        /// Control stream id (V2 only).
        stream_id: Option<u64>,
        /// Payload (empty for V1).
        params: GoAwayParams,
    },
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
    /// Stream reset by the peer.
    Reset {
        /// Reset stream.
        stream_id: u64,
        /// Application error code.
        error_code: u64,
    },
}

impl DecodedFrame {
    /// Frame type name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            DecodedFrame::Data { frame, .. } => frame.frame_type.as_str(),
            DecodedFrame::Initialize { .. } => FrameType::Initialize.as_str(),
            DecodedFrame::GoAway { .. } => FrameType::GoAway.as_str(),
            DecodedFrame::Ping => FrameType::Ping.as_str(),
            DecodedFrame::Pong => FrameType::Pong.as_str(),
            DecodedFrame::Reset { .. } => FrameType::ResetStream.as_str(),
        }
    }
}

/// Decode a raw frame, decompressing its body if needed.
///
/// A compressed body whose announced uncompressed size exceeds
/// `max_frame_size` is rejected before anything is allocated for it.
pub fn decode_frame(
    raw: RawFrame,
    settings: &CompressionSettings,
    max_frame_size: usize,
) -> Result<DecodedFrame> {
    match raw.header.protocol {
        Protocol::V1 => decode_v1(raw, settings, max_frame_size),
        Protocol::V2 => decode_v2(raw, settings, max_frame_size),
    }
}

fn check_uncompressed_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(RpcError::FrameTooLarge { size, max });
    }
    Ok(())
}

fn read_i32(buf: &mut &[u8], what: &str) -> Result<i32> {
    if buf.len() < 4 {
        return Err(RpcError::Protocol(format!("truncated {}", what)));
    }
    let value = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(value)
}

fn decode_v1(raw: RawFrame, settings: &CompressionSettings, max_frame_size: usize) -> Result<DecodedFrame> {
    let header = raw.header;
    let body = if header.compression == CompressionStatus::Compressed {
        let mut cursor: &[u8] = &raw.body;
        let total = read_i32(&mut cursor, "uncompressed size")?;
        let total = usize::try_from(total)
            .ok()
            .filter(|t| *t >= V1_HEADER_SIZE)
            .ok_or_else(|| {
                RpcError::Protocol(format!("invalid uncompressed frame size {}", total))
            })?;
        check_uncompressed_size(total, max_frame_size)?;
        let expected = total - V1_HEADER_SIZE;
        Bytes::from(decompress_body(cursor, expected, settings)?)
    } else {
        raw.body
    };

    match header.frame_type {
        FrameType::Request | FrameType::Response => {
            let mut cursor: &[u8] = &body;
            let request_id = read_i32(&mut cursor, "request id")?;
            if request_id < 0 {
                return Err(RpcError::Protocol(format!(
                    "negative request id {}",
                    request_id
                )));
            }
            if header.frame_type == FrameType::Response && request_id == 0 {
                return Err(RpcError::Protocol(
                    "reply without request id".to_string(),
                ));
            }
            let payload = body.slice(4..);
            Ok(DecodedFrame::Data {
                stream: StreamRef::RequestId(request_id),
                frame: Frame {
                    frame_type: header.frame_type,
                    compression: header.compression,
                    payload,
                },
                fin: true,
            })
        }
        FrameType::RequestBatch => {
            let mut cursor: &[u8] = &body;
            let count = read_i32(&mut cursor, "batch request count")?;
            if count < 0 {
                return Err(RpcError::Protocol(
                    "negative batch request count".to_string(),
                ));
            }
            Err(RpcError::NotSupported(format!(
                "batch requests ({} requests received)",
                count
            )))
        }
        FrameType::Initialize | FrameType::GoAway => {
            if !body.is_empty() {
                return Err(RpcError::Protocol(format!(
                    "{} frame with a {}-byte body",
                    header.frame_type.as_str(),
                    body.len()
                )));
            }
            if header.frame_type == FrameType::Initialize {
                Ok(DecodedFrame::Initialize {
                    stream_id: None,
                    params: None,
                })
            } else {
                Ok(DecodedFrame::GoAway {
                    stream_id: None,
                    params: GoAwayParams::default(),
                })
            }
        }
        other => Err(RpcError::Protocol(format!(
            "{} frame in protocol 1",
            other.as_str()
        ))),
    }
}

fn decode_last_id(encoded: u64) -> Option<u64> {
    encoded.checked_sub(1)
}

fn encode_last_id(id: Option<u64>) -> u64 {
    id.map_or(0, |id| id + 1)
}

fn decode_v2(raw: RawFrame, settings: &CompressionSettings, max_frame_size: usize) -> Result<DecodedFrame> {
    let body = raw.body;
    let mut cursor: &[u8] = &body;
    match raw.header.frame_type {
        FrameType::Request | FrameType::Response => {
            let stream_id = read_varint(&mut cursor)?;
            if cursor.len() < 2 {
                return Err(RpcError::Protocol("truncated data frame".to_string()));
            }
            let fin = cursor[0] & FLAG_FIN != 0;
            if cursor[0] & !FLAG_FIN != 0 {
                return Err(RpcError::Protocol(format!(
                    "reserved data frame flags set: {:#04x}",
                    cursor[0]
                )));
            }
            let compression = CompressionStatus::try_from(cursor[1])?;
            cursor = &cursor[2..];
            let payload = if compression == CompressionStatus::Compressed {
                let len = read_varint(&mut cursor)?;
                let len = usize::try_from(len).map_err(|_| RpcError::FrameTooLarge {
                    size: usize::MAX,
                    max: max_frame_size,
                })?;
                check_uncompressed_size(len, max_frame_size)?;
                Bytes::from(decompress_body(cursor, len, settings)?)
            } else {
                body.slice(body.len() - cursor.len()..)
            };
            Ok(DecodedFrame::Data {
                stream: StreamRef::Id(stream_id),
                frame: Frame {
                    frame_type: raw.header.frame_type,
                    compression,
                    payload,
                },
                fin,
            })
        }
        FrameType::Initialize => {
            let stream_id = read_varint(&mut cursor)?;
            let params = InitializeParams {
                version: read_varint(&mut cursor)?,
                max_frame_size: read_varint(&mut cursor)?,
                idle_timeout_ms: read_varint(&mut cursor)?,
            };
            Ok(DecodedFrame::Initialize {
                stream_id: Some(stream_id),
                params: Some(params),
            })
        }
        FrameType::GoAway => {
            let stream_id = read_varint(&mut cursor)?;
            let last_bidirectional = decode_last_id(read_varint(&mut cursor)?);
            let last_unidirectional = decode_last_id(read_varint(&mut cursor)?);
            let reason_len = read_varint(&mut cursor)? as usize;
            if cursor.len() < reason_len {
                return Err(RpcError::Protocol("truncated GoAway reason".to_string()));
            }
            let reason = std::str::from_utf8(&cursor[..reason_len])
                .map_err(|e| RpcError::Protocol(format!("GoAway reason is not UTF-8: {}", e)))?
                .to_string();
            Ok(DecodedFrame::GoAway {
                stream_id: Some(stream_id),
                params: GoAwayParams {
                    last_bidirectional,
                    last_unidirectional,
                    reason,
                },
            })
        }
        FrameType::Ping => Ok(DecodedFrame::Ping),
        FrameType::Pong => Ok(DecodedFrame::Pong),
        FrameType::ResetStream => {
            let stream_id = read_varint(&mut cursor)?;
            let error_code = read_varint(&mut cursor)?;
            Ok(DecodedFrame::Reset {
                stream_id,
                error_code,
            })
        }
        FrameType::RequestBatch => Err(RpcError::Protocol(
            "RequestBatch frame in protocol 2".to_string(),
        )),
    }
}

fn finish(mut buf: BytesMut, protocol: Protocol) -> Result<Bytes> {
    patch_size(&mut buf, protocol)?;
    Ok(buf.freeze())
}

/// Build a complete Request or Response frame.
///
/// `compress` is the caller's wish; the [`CompressionSettings`] decide whether
/// the body is actually compressed.
pub fn encode_data_frame(
    protocol: Protocol,
    frame_type: FrameType,
    stream: StreamRef,
    fin: bool,
    payload: &[u8],
    compress: bool,
    settings: &CompressionSettings,
) -> Result<Bytes> {
    if !frame_type.is_data() {
        return Err(RpcError::Protocol(format!(
            "{} is not a data frame",
            frame_type.as_str()
        )));
    }
    let mut buf = BytesMut::with_capacity(placeholder_header_len(protocol) + payload.len() + 16);
    write_header(&mut buf, frame_type, protocol)?;
    match (protocol, stream) {
        (Protocol::V1, StreamRef::RequestId(request_id)) => {
            if !fin {
                return Err(RpcError::NotSupported(
                    "protocol 1 frames cannot leave a stream open".to_string(),
                ));
            }
            buf.put_i32_le(request_id);
            buf.put_slice(payload);
            match compress_body(&buf[V1_HEADER_SIZE..], compress, settings)? {
                Compressed::Yes(data) => {
                    let uncompressed_total = buf.len() as i32;
                    let mut out = BytesMut::with_capacity(V1_HEADER_SIZE + 4 + data.len());
                    out.put_slice(&buf[..V1_HEADER_SIZE]);
                    out[V1_COMPRESSION_OFFSET] = CompressionStatus::Compressed as u8;
                    out.put_i32_le(uncompressed_total);
                    out.put_slice(&data);
                    finish(out, protocol)
                }
                Compressed::No(status) => {
                    buf[V1_COMPRESSION_OFFSET] = status as u8;
                    finish(buf, protocol)
                }
            }
        }
        (Protocol::V2, StreamRef::Id(stream_id)) => {
            put_varint(&mut buf, stream_id)?;
            buf.put_u8(if fin { FLAG_FIN } else { 0 });
            match compress_body(payload, compress, settings)? {
                Compressed::Yes(data) => {
                    buf.put_u8(CompressionStatus::Compressed as u8);
                    put_varint(&mut buf, payload.len() as u64)?;
                    buf.put_slice(&data);
                }
                Compressed::No(status) => {
                    buf.put_u8(status as u8);
                    buf.put_slice(payload);
                }
            }
            finish(buf, protocol)
        }
        (protocol, stream) => Err(RpcError::Protocol(format!(
            "stream reference {:?} is not valid for protocol {}",
            stream, protocol
        ))),
    }
}

/// Build an Initialize (V2) or ValidateConnection (V1) frame.
pub fn encode_initialize(
    protocol: Protocol,
    stream_id: u64,
    params: &InitializeParams,
) -> Result<Bytes> {
    match protocol {
        Protocol::V1 => Ok(Bytes::from_static(&VALIDATE_CONNECTION_FRAME)),
        Protocol::V2 => {
            let mut buf = BytesMut::with_capacity(32);
            write_header(&mut buf, FrameType::Initialize, protocol)?;
            put_varint(&mut buf, stream_id)?;
            put_varint(&mut buf, params.version)?;
            put_varint(&mut buf, params.max_frame_size)?;
            put_varint(&mut buf, params.idle_timeout_ms)?;
            finish(buf, protocol)
        }
    }
}

/// Build a GoAway (V2) or CloseConnection (V1) frame.
pub fn encode_go_away(protocol: Protocol, stream_id: u64, params: &GoAwayParams) -> Result<Bytes> {
    match protocol {
        Protocol::V1 => Ok(Bytes::from_static(&CLOSE_CONNECTION_FRAME)),
        Protocol::V2 => {
            let mut buf = BytesMut::with_capacity(32 + params.reason.len());
            write_header(&mut buf, FrameType::GoAway, protocol)?;
            put_varint(&mut buf, stream_id)?;
            put_varint(&mut buf, encode_last_id(params.last_bidirectional))?;
            put_varint(&mut buf, encode_last_id(params.last_unidirectional))?;
            put_varint(&mut buf, params.reason.len() as u64)?;
            buf.put_slice(params.reason.as_bytes());
            finish(buf, protocol)
        }
    }
}

/// Build a heartbeat: ValidateConnection for V1, Ping for V2.
pub fn encode_ping(protocol: Protocol) -> Bytes {
    match protocol {
        Protocol::V1 => Bytes::from_static(&VALIDATE_CONNECTION_FRAME),
        Protocol::V2 => Bytes::from_static(&V2_PING_FRAME),
    }
}

/// Build a Pong (V2 only).
pub fn encode_pong(protocol: Protocol) -> Result<Bytes> {
    match protocol {
        Protocol::V1 => Err(RpcError::NotSupported(
            "protocol 1 has no Pong frame".to_string(),
        )),
        Protocol::V2 => Ok(Bytes::from_static(&V2_PONG_FRAME)),
    }
}

/// Build a ResetStream frame (V2 only).
pub fn encode_reset(protocol: Protocol, stream_id: u64, error_code: u64) -> Result<Bytes> {
    match protocol {
        Protocol::V1 => Err(RpcError::NotSupported(
            "protocol 1 cannot reset a stream".to_string(),
        )),
        Protocol::V2 => {
            let mut buf = BytesMut::with_capacity(24);
            write_header(&mut buf, FrameType::ResetStream, protocol)?;
            put_varint(&mut buf, stream_id)?;
            put_varint(&mut buf, error_code)?;
            finish(buf, protocol)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::rle_settings;
    use crate::protocol::wire_format::decode_header;

    fn raw(bytes: &Bytes, protocol: Protocol) -> RawFrame {
        let header = decode_header(bytes, protocol).unwrap().unwrap();
        assert_eq!(header.frame_len(), bytes.len());
        RawFrame {
            header,
            body: bytes.slice(header.header_len..),
        }
    }

    fn decode(bytes: &Bytes, protocol: Protocol, settings: &CompressionSettings) -> DecodedFrame {
        decode_frame(raw(bytes, protocol), settings, usize::MAX).unwrap()
    }

    #[test]
    fn test_v1_request_layout() {
        let settings = CompressionSettings::default();
        let bytes = encode_data_frame(
            Protocol::V1,
            FrameType::Request,
            StreamRef::RequestId(7),
            true,
            b"abc",
            false,
            &settings,
        )
        .unwrap();
        assert_eq!(bytes.len(), V1_HEADER_SIZE + 4 + 3);
        assert_eq!(bytes[8], 0);
        assert_eq!(&bytes[14..18], &7i32.to_le_bytes());

        match decode(&bytes, Protocol::V1, &settings) {
            DecodedFrame::Data { stream, frame, fin } => {
                assert_eq!(stream, StreamRef::RequestId(7));
                assert_eq!(frame.frame_type, FrameType::Request);
                assert_eq!(frame.payload(), b"abc");
                assert!(fin);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_v1_open_stream_not_supported() {
        let err = encode_data_frame(
            Protocol::V1,
            FrameType::Request,
            StreamRef::RequestId(1),
            false,
            b"",
            false,
            &CompressionSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::NotSupported(_)));
    }

    #[test]
    fn test_v1_compressed_request() {
        let settings = rle_settings(10);
        let payload = vec![9u8; 300];
        let bytes = encode_data_frame(
            Protocol::V1,
            FrameType::Request,
            StreamRef::RequestId(3),
            true,
            &payload,
            true,
            &settings,
        )
        .unwrap();
        assert_eq!(bytes[V1_COMPRESSION_OFFSET], 2);
        assert!(bytes.len() < V1_HEADER_SIZE + 4 + payload.len());

        match decode(&bytes, Protocol::V1, &settings) {
            DecodedFrame::Data { stream, frame, .. } => {
                assert_eq!(stream, StreamRef::RequestId(3));
                assert_eq!(frame.compression, CompressionStatus::Compressed);
                assert_eq!(frame.payload(), &payload[..]);
                assert!(frame.wants_compressed_response());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_v1_compressed_without_codec_fails() {
        let bytes = encode_data_frame(
            Protocol::V1,
            FrameType::Request,
            StreamRef::RequestId(3),
            true,
            &[1u8; 300],
            true,
            &rle_settings(10),
        )
        .unwrap();
        let err = decode_frame(raw(&bytes, Protocol::V1), &CompressionSettings::default(), usize::MAX)
            .unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedCompression));
    }

    #[test]
    fn test_v1_negative_batch_count() {
        let mut buf = BytesMut::new();
        write_header(&mut buf, FrameType::RequestBatch, Protocol::V1).unwrap();
        buf.put_i32_le(-3);
        let bytes = finish(buf, Protocol::V1).unwrap();

        let err = decode_frame(raw(&bytes, Protocol::V1), &CompressionSettings::default(), usize::MAX)
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(ref m) if m == "negative batch request count"));
    }

    #[test]
    fn test_v1_batch_not_supported() {
        let mut buf = BytesMut::new();
        write_header(&mut buf, FrameType::RequestBatch, Protocol::V1).unwrap();
        buf.put_i32_le(2);
        let bytes = finish(buf, Protocol::V1).unwrap();

        let err = decode_frame(raw(&bytes, Protocol::V1), &CompressionSettings::default(), usize::MAX)
            .unwrap_err();
        assert!(matches!(err, RpcError::NotSupported(_)));
    }

    #[test]
    fn test_v1_reply_without_request_id() {
        let bytes = encode_data_frame(
            Protocol::V1,
            FrameType::Response,
            StreamRef::RequestId(0),
            true,
            b"",
            false,
            &CompressionSettings::default(),
        )
        .unwrap();
        assert!(decode_frame(raw(&bytes, Protocol::V1), &CompressionSettings::default(), usize::MAX).is_err());
    }

    #[test]
    fn test_v1_control_frames() {
        let settings = CompressionSettings::default();
        let params = InitializeParams {
            version: 1,
            max_frame_size: 10,
            idle_timeout_ms: 0,
        };
        let validate = encode_initialize(Protocol::V1, 3, &params).unwrap();
        assert_eq!(&validate[..], &VALIDATE_CONNECTION_FRAME);
        assert_eq!(
            decode(&validate, Protocol::V1, &settings),
            DecodedFrame::Initialize {
                stream_id: None,
                params: None
            }
        );

        let close = encode_go_away(Protocol::V1, 3, &GoAwayParams::default()).unwrap();
        assert!(matches!(
            decode(&close, Protocol::V1, &settings),
            DecodedFrame::GoAway { stream_id: None, .. }
        ));
        assert!(encode_reset(Protocol::V1, 0, 1).is_err());
        assert!(encode_pong(Protocol::V1).is_err());
    }

    #[test]
    fn test_v2_data_frame_fin_flag() {
        let settings = CompressionSettings::default();
        let bytes = encode_data_frame(
            Protocol::V2,
            FrameType::Response,
            StreamRef::Id(9),
            false,
            b"part",
            false,
            &settings,
        )
        .unwrap();
        match decode(&bytes, Protocol::V2, &settings) {
            DecodedFrame::Data { stream, frame, fin } => {
                assert_eq!(stream, StreamRef::Id(9));
                assert_eq!(frame.frame_type, FrameType::Response);
                assert_eq!(frame.payload(), b"part");
                assert!(!fin);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_v2_compressed_data_frame() {
        let settings = rle_settings(16);
        let payload = vec![b'z'; 1000];
        let bytes = encode_data_frame(
            Protocol::V2,
            FrameType::Request,
            StreamRef::Id(0),
            true,
            &payload,
            true,
            &settings,
        )
        .unwrap();
        assert!(bytes.len() < payload.len());
        match decode(&bytes, Protocol::V2, &settings) {
            DecodedFrame::Data { frame, .. } => {
                assert_eq!(frame.compression, CompressionStatus::Compressed);
                assert_eq!(frame.payload(), &payload[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_uncompressed_size_checked_against_max() {
        let settings = rle_settings(10);
        let payload = vec![7u8; 300];
        for (protocol, stream, announced) in [
            (Protocol::V1, StreamRef::RequestId(1), V1_HEADER_SIZE + 4 + 300),
            (Protocol::V2, StreamRef::Id(0), 300),
        ] {
            let bytes =
                encode_data_frame(protocol, FrameType::Request, stream, true, &payload, true, &settings)
                    .unwrap();
            let err = decode_frame(raw(&bytes, protocol), &settings, 100).unwrap_err();
            assert!(
                matches!(err, RpcError::FrameTooLarge { size, max: 100 } if size == announced),
                "{:?}: {:?}",
                protocol,
                err
            );
        }
    }

    #[test]
    fn test_v2_oversized_announcement_rejected_before_allocation() {
        let mut buf = BytesMut::new();
        write_header(&mut buf, FrameType::Request, Protocol::V2).unwrap();
        put_varint(&mut buf, 0).unwrap();
        buf.put_u8(FLAG_FIN);
        buf.put_u8(CompressionStatus::Compressed as u8);
        put_varint(&mut buf, 1 << 50).unwrap();
        buf.put_slice(&[0u8; 8]);
        let bytes = finish(buf, Protocol::V2).unwrap();

        let err = decode_frame(raw(&bytes, Protocol::V2), &rle_settings(10), 16 * 1024).unwrap_err();
        assert!(matches!(
            err,
            RpcError::FrameTooLarge {
                size: 1125899906842624,
                max: 16384
            }
        ));
    }

    #[test]
    fn test_v2_initialize() {
        let params = InitializeParams {
            version: 1,
            max_frame_size: 65_536,
            idle_timeout_ms: 30_000,
        };
        let bytes = encode_initialize(Protocol::V2, 2, &params).unwrap();
        assert_eq!(
            decode(&bytes, Protocol::V2, &CompressionSettings::default()),
            DecodedFrame::Initialize {
                stream_id: Some(2),
                params: Some(params)
            }
        );
    }

    #[test]
    fn test_v2_go_away_payload() {
        let params = GoAwayParams {
            last_bidirectional: Some(8),
            last_unidirectional: None,
            reason: "shutting down".to_string(),
        };
        let bytes = encode_go_away(Protocol::V2, 3, &params).unwrap();
        assert_eq!(
            decode(&bytes, Protocol::V2, &CompressionSettings::default()),
            DecodedFrame::GoAway {
                stream_id: Some(3),
                params
            }
        );
    }

    #[test]
    fn test_v2_go_away_first_stream_is_distinct_from_none() {
        let params = GoAwayParams {
            last_bidirectional: Some(0),
            last_unidirectional: None,
            reason: String::new(),
        };
        let bytes = encode_go_away(Protocol::V2, 2, &params).unwrap();
        match decode(&bytes, Protocol::V2, &CompressionSettings::default()) {
            DecodedFrame::GoAway { params: decoded, .. } => {
                assert_eq!(decoded.last_bidirectional, Some(0));
                assert_eq!(decoded.last_unidirectional, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_v2_reset_and_keepalive() {
        let settings = CompressionSettings::default();
        let bytes = encode_reset(Protocol::V2, 12, 99).unwrap();
        assert_eq!(
            decode(&bytes, Protocol::V2, &settings),
            DecodedFrame::Reset {
                stream_id: 12,
                error_code: 99
            }
        );
        assert_eq!(
            decode(&encode_ping(Protocol::V2), Protocol::V2, &settings),
            DecodedFrame::Ping
        );
        assert_eq!(
            decode(&encode_pong(Protocol::V2).unwrap(), Protocol::V2, &settings),
            DecodedFrame::Pong
        );
    }

    #[test]
    fn test_v2_reserved_flags_rejected() {
        let settings = CompressionSettings::default();
        let bytes = encode_data_frame(
            Protocol::V2,
            FrameType::Request,
            StreamRef::Id(0),
            true,
            b"x",
            false,
            &settings,
        )
        .unwrap();
        let mut tampered = bytes.to_vec();
        // type(1) + size(4) + stream id(1) -> flags byte
        tampered[6] = 0x80;
        let tampered = Bytes::from(tampered);
        assert!(decode_frame(raw(&tampered, Protocol::V2), &settings, usize::MAX).is_err());
    }

    #[test]
    fn test_stream_ref_must_match_protocol() {
        let settings = CompressionSettings::default();
        assert!(encode_data_frame(
            Protocol::V2,
            FrameType::Request,
            StreamRef::RequestId(1),
            true,
            b"",
            false,
            &settings
        )
        .is_err());
        assert!(encode_data_frame(
            Protocol::V1,
            FrameType::Ping,
            StreamRef::RequestId(1),
            true,
            b"",
            false,
            &settings
        )
        .is_err());
    }
}
