//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the frame codec for both protocol families:
//! - V1 14-byte header and V2 varint-sized header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame body encoding, compression, and routing information

mod frame;
mod frame_buffer;
mod varint;
mod wire_format;

pub use frame::{
    decode_frame, encode_data_frame, encode_go_away, encode_initialize, encode_ping, encode_pong,
    encode_reset, DecodedFrame, Frame, GoAwayParams, InitializeParams, RawFrame, StreamRef,
    V2_PING_FRAME, V2_PONG_FRAME,
};
pub use frame_buffer::{decode_datagram, FrameBuffer};
pub use varint::{decode_varint, encoded_len, put_varint, read_varint, VARINT_MAX};
pub use wire_format::{
    check_header, decode_header, patch_size, read_size, write_header, write_size,
    CompressionStatus, FrameType, Header, Protocol, CLOSE_CONNECTION_FRAME,
    DEFAULT_MAX_FRAME_SIZE, V1_HEADER_SIZE, V1_MAGIC, V2_MAX_HEADER_SIZE, V2_PROTOCOL_VERSION,
    VALIDATE_CONNECTION_FRAME,
};
