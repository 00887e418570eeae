//! Inbound frame extraction.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{decode_datagram, FrameBuffer, Protocol, RawFrame};
use crate::transport::Transceiver;

const READ_CHUNK: usize = 64 * 1024;

/// Turns transceiver reads into complete raw frames.
///
/// Byte streams go through a [`FrameBuffer`]; each datagram is decoded on its
/// own and a malformed datagram is logged and skipped.
pub(super) struct FrameReader {
    transceiver: Arc<dyn Transceiver>,
    protocol: Protocol,
    max_frame_size: usize,
    buffer: FrameBuffer,
    ready: VecDeque<RawFrame>,
    chunk: Vec<u8>,
}

impl FrameReader {
    pub(super) fn new(
        transceiver: Arc<dyn Transceiver>,
        protocol: Protocol,
        max_frame_size: usize,
    ) -> Self {
        let chunk = if transceiver.is_datagram() {
            // One extra byte detects oversized datagrams.
            max_frame_size.min(crate::transport::MAX_UDP_PAYLOAD) + 1
        } else {
            READ_CHUNK
        };
        Self {
            transceiver,
            protocol,
            max_frame_size,
            buffer: FrameBuffer::with_max_frame_size(protocol, max_frame_size),
            ready: VecDeque::new(),
            chunk: vec![0; chunk],
        }
    }

    /// Next complete frame, or `None` at end of stream.
    pub(super) async fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(frame));
            }
            let n = self.transceiver.receive(&mut self.chunk).await?;
            if self.transceiver.is_datagram() {
                match decode_datagram(self.protocol, &self.chunk[..n], self.max_frame_size) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => {
                        tracing::warn!(size = n, error = %err, "discarding malformed datagram");
                        continue;
                    }
                }
            }
            if n == 0 {
                if !self.buffer.is_empty() {
                    tracing::debug!(buffered = self.buffer.len(), "end of stream inside a frame");
                }
                return Ok(None);
            }
            self.ready.extend(self.buffer.push(&self.chunk[..n])?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionSettings;
    use crate::protocol::{encode_data_frame, FrameType, StreamRef};
    use crate::transport::{MemoryNetwork, StreamTransceiver};

    fn request(id: u64, payload: &[u8]) -> bytes::Bytes {
        encode_data_frame(
            Protocol::V2,
            FrameType::Request,
            StreamRef::Id(id),
            true,
            payload,
            false,
            &CompressionSettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reads_coalesced_frames() {
        let (a, b) = tokio::io::duplex(1024);
        let writer = StreamTransceiver::new(a, "a");
        let mut reader = FrameReader::new(Arc::new(StreamTransceiver::new(b, "b")), Protocol::V2, 1024);

        writer
            .send(&[request(0, b"one"), request(4, b"two")])
            .await
            .unwrap();
        writer.close("done").await.unwrap();

        let first = reader.next_frame().await.unwrap().unwrap();
        assert!(first.body.ends_with(b"one"));
        let second = reader.next_frame().await.unwrap().unwrap();
        assert!(second.body.ends_with(b"two"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_skips_malformed_datagram() {
        let (left, right) = MemoryNetwork::datagram_pair();
        let mut reader = FrameReader::new(Arc::new(right), Protocol::V1, 1024);

        left.send(&[bytes::Bytes::from_static(&[1, 2, 3])]).await.unwrap();
        let frame = encode_data_frame(
            Protocol::V1,
            FrameType::Request,
            StreamRef::RequestId(0),
            true,
            b"oneway",
            false,
            &CompressionSettings::default(),
        )
        .unwrap();
        left.send(&[frame]).await.unwrap();

        let raw = reader.next_frame().await.unwrap().unwrap();
        assert!(raw.body.ends_with(b"oneway"));
    }
}
