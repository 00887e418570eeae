//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: need the whole header (14 bytes for V1, type byte
//!   plus a complete varint for V2)
//! - `WaitingForPayload`: header parsed, need N more body bytes
//!
//! Datagram transports do not accumulate: each datagram must hold exactly one
//! frame, see [`decode_datagram`].
//!
//! # Example
//!
//! ```
//! use rpcmux::protocol::{FrameBuffer, Protocol, VALIDATE_CONNECTION_FRAME};
//!
//! let mut buffer = FrameBuffer::new(Protocol::V1);
//!
//! // Data arrives in chunks from the transceiver
//! assert!(buffer.push(&VALIDATE_CONNECTION_FRAME[..6]).unwrap().is_empty());
//! let frames = buffer.push(&VALIDATE_CONNECTION_FRAME[6..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::BytesMut;

use super::frame::RawFrame;
use super::wire_format::{decode_header, Header, Protocol, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{Result, RpcError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for body bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Protocol used to parse headers.
    protocol: Protocol,
    /// Accumulated bytes from transceiver reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame size, header included.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 1MB.
    pub fn new(protocol: Protocol) -> Self {
        Self::with_max_frame_size(protocol, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(protocol: Protocol, max_frame_size: usize) -> Self {
        Self {
            protocol,
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error on a malformed header or a frame larger than the
    /// configured maximum. The buffer should be discarded afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<RawFrame>> {
        match &self.state {
            State::WaitingForHeader => {
                let Some(header) = decode_header(&self.buffer, self.protocol)? else {
                    return Ok(None);
                };
                check_frame_size(&header, self.max_frame_size)?;

                let _ = self.buffer.split_to(header.header_len);
                self.state = State::WaitingForPayload { header };
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                if self.buffer.len() < header.body_len {
                    self.buffer.reserve(header.body_len - self.buffer.len());
                    return Ok(None);
                }
                let header = *header;
                let body = self.buffer.split_to(header.body_len).freeze();
                self.state = State::WaitingForHeader;
                Ok(Some(RawFrame { header, body }))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

fn check_frame_size(header: &Header, max_frame_size: usize) -> Result<()> {
    if header.frame_len() > max_frame_size {
        return Err(RpcError::FrameTooLarge {
            size: header.frame_len(),
            max: max_frame_size,
        });
    }
    Ok(())
}

/// Decode one datagram as a single frame.
///
/// The datagram must hold a complete header and exactly the announced frame.
pub fn decode_datagram(protocol: Protocol, datagram: &[u8], max_frame_size: usize) -> Result<RawFrame> {
    let header = decode_header(datagram, protocol)?.ok_or_else(|| {
        RpcError::Protocol(format!(
            "datagram of {} bytes is smaller than a frame header",
            datagram.len()
        ))
    })?;
    check_frame_size(&header, max_frame_size)?;
    if header.frame_len() != datagram.len() {
        return Err(RpcError::Protocol(format!(
            "datagram of {} bytes announces a {}-byte frame",
            datagram.len(),
            header.frame_len()
        )));
    }
    Ok(RawFrame {
        header,
        body: bytes::Bytes::copy_from_slice(&datagram[header.header_len..]),
    })
}
