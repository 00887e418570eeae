//! Byte-stream transceiver over any tokio I/O object.
//!
//! Writes use scatter/gather I/O (`write_vectored`) so a batch of frames from
//! the writer task usually costs one syscall plus a flush.

use std::fmt;
use std::io::IoSlice;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::Transceiver;
use crate::error::{Result, RpcError};

/// Transceiver for TCP sockets, duplex pipes and other byte streams.
pub struct StreamTransceiver<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    description: String,
}

impl<S> StreamTransceiver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connected I/O object.
    pub fn new(io: S, description: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            description: description.into(),
        }
    }

    fn io_error(&self, err: std::io::Error) -> RpcError {
        RpcError::transport(self.description.clone(), err)
    }
}

impl<S> fmt::Debug for StreamTransceiver<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransceiver")
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl<S> Transceiver for StreamTransceiver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, buffers: &[Bytes]) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        write_all_vectored(&mut *writer, buffers)
            .await
            .map_err(|err| self.io_error(err))
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await.map_err(|err| self.io_error(err))
    }

    async fn close(&self, reason: &str) -> Result<()> {
        tracing::debug!(transport = %self.description, reason, "closing stream transceiver");
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            // The peer may already be gone.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }

    fn check_send_size(&self, _size: usize) -> Result<()> {
        Ok(())
    }

    fn is_datagram(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

/// Write every buffer, continuing after partial vectored writes, then flush.
async fn write_all_vectored<W>(writer: &mut W, buffers: &[Bytes]) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = buffers.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = remaining_slices(buffers, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(total_size)
}

/// Build the IoSlice array for the data left after `skip_bytes`.
fn remaining_slices(buffers: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(buffers.len());
    let mut start = 0;

    for buffer in buffers {
        let end = start + buffer.len();
        if skip_bytes < end && !buffer.is_empty() {
            let offset = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&buffer[offset..]));
        }
        start = end;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_remaining_slices_no_skip() {
        let buffers = [Bytes::from_static(b"header"), Bytes::from_static(b"hello")];
        let slices = remaining_slices(&buffers, 0);
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_remaining_slices_partial_first() {
        let buffers = [Bytes::from_static(b"header"), Bytes::from_static(b"hello")];
        let slices = remaining_slices(&buffers, 4);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_remaining_slices_skips_empty_and_written() {
        let buffers = [
            Bytes::from_static(b"header"),
            Bytes::new(),
            Bytes::from_static(b"hello"),
        ];
        let slices = remaining_slices(&buffers, 6);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"hello");
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (a, b) = duplex(1024);
        let left = StreamTransceiver::new(a, "left");
        let right = StreamTransceiver::new(b, "right");

        let sent = left
            .send(&[Bytes::from_static(b"abc"), Bytes::from_static(b"def")])
            .await
            .unwrap();
        assert_eq!(sent, 6);

        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        while received.len() < 6 {
            let n = right.receive(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"abcdef");
    }

    #[tokio::test]
    async fn test_close_signals_end_of_stream() {
        let (a, b) = duplex(1024);
        let left = StreamTransceiver::new(a, "left");
        let right = StreamTransceiver::new(b, "right");

        left.close("done").await.unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(right.receive(&mut buf).await.unwrap(), 0);
    }
}
