//! Dedicated writer task: the connection's single outbound queue.
//!
//! Every frame of a connection, data and control alike, is handed to one
//! writer task through an mpsc channel. The task writes frames in queue
//! order, so bytes of two frames never interleave on the wire, and batches
//! whatever is ready into a single transceiver send.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::UnboundedSender<WriterCommand> ─► Writer Task ─► Transceiver
//! Control  ─┘
//! ```
//!
//! Enqueueing is synchronous so a caller can allocate a stream id and enqueue
//! the frame carrying it under one lock. Queue depth is bounded separately by
//! a semaphore: a [`WriteSlot`] must be reserved before enqueueing and is
//! released once the frame is written or skipped.
//!
//! A frame queued with a cancellation token is skipped if the token fires
//! before the writer reaches it; its sender gets [`RpcError::Cancelled`] and
//! the frames behind it are unaffected.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RpcError};
use crate::transport::Transceiver;

/// Default maximum queued frames before senders wait.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default maximum frames written in one transceiver send.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum queued frames before senders wait for a slot.
    pub max_pending_frames: usize,
    /// Maximum frames batched into one send on stream transports.
    pub max_batch_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl WriterConfig {
    /// Check that both limits are positive.
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_frames == 0 || self.max_batch_size == 0 {
            return Err(RpcError::Config(
                "writer limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A reserved place in the outbound queue.
#[derive(Debug)]
pub struct WriteSlot {
    _permit: OwnedSemaphorePermit,
}

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Complete encoded frame.
    pub bytes: Bytes,
    cancel: Option<CancellationToken>,
    done: oneshot::Sender<Result<()>>,
    _slot: WriteSlot,
}

impl OutboundFrame {
    /// Total size of this frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

/// Queue entries.
#[derive(Debug)]
enum WriterCommand {
    Frame(OutboundFrame),
    /// Write everything queued before this, then stop.
    Shutdown,
}

/// Completion of a queued frame.
pub type WriteCompletion = oneshot::Receiver<Result<()>>;

/// Handle for queueing frames on the writer task.
///
/// This is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterCommand>,
    slots: Arc<Semaphore>,
    max_pending: usize,
}

impl WriterHandle {
    /// Wait for a free queue slot.
    ///
    /// Fails once the writer has been closed.
    pub async fn reserve(&self) -> Result<WriteSlot> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map(|permit| WriteSlot { _permit: permit })
            .map_err(|_| RpcError::closed_locally())
    }

    /// Take a free queue slot without waiting.
    pub fn try_reserve(&self) -> Option<WriteSlot> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| WriteSlot { _permit: permit })
    }

    /// Queue a frame. The returned receiver resolves once the frame is
    /// written, skipped or failed.
    pub fn enqueue(
        &self,
        slot: WriteSlot,
        bytes: Bytes,
        cancel: Option<CancellationToken>,
    ) -> Result<WriteCompletion> {
        let (done, completion) = oneshot::channel();
        let frame = OutboundFrame {
            bytes,
            cancel,
            done,
            _slot: slot,
        };
        self.tx
            .send(WriterCommand::Frame(frame))
            .map_err(|_| RpcError::closed_locally())?;
        Ok(completion)
    }

    /// Reserve, queue and wait for the write.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        let slot = self.reserve().await?;
        let completion = self.enqueue(slot, bytes, None)?;
        completion.await.map_err(|_| RpcError::closed_locally())?
    }

    /// Ask the writer to stop after the frames already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
    }

    /// Refuse new reservations; waiting senders fail.
    pub fn close(&self) {
        self.slots.close();
    }

    /// Get current queued frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.max_pending - self.slots.available_permits()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task ends with `Ok` after [`WriterHandle::shutdown`] or once every
/// handle is dropped, and with the transceiver error if a send fails.
pub fn spawn_writer_task(
    transceiver: Arc<dyn Transceiver>,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let max_pending = config.max_pending_frames.max(1);
    let handle = WriterHandle {
        tx,
        slots: Arc::new(Semaphore::new(max_pending)),
        max_pending,
    };
    // Datagram transports send one frame per datagram.
    let max_batch = if transceiver.is_datagram() {
        1
    } else {
        config.max_batch_size.max(1)
    };
    let task = tokio::spawn(writer_loop(rx, transceiver, max_batch));
    (handle, task)
}

/// Main writer loop - receives frames and writes them in batches.
async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    transceiver: Arc<dyn Transceiver>,
    max_batch: usize,
) -> Result<()> {
    loop {
        let first = match rx.recv().await {
            Some(WriterCommand::Frame(frame)) => frame,
            Some(WriterCommand::Shutdown) | None => return Ok(()),
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(max_batch);
        batch.push(first);
        let mut stop = false;
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(WriterCommand::Frame(frame)) => batch.push(frame),
                Ok(WriterCommand::Shutdown) => {
                    stop = true;
                    break;
                }
                Err(_) => break,
            }
        }

        write_batch(&*transceiver, batch).await?;
        if stop {
            return Ok(());
        }
    }
}

/// Write a batch, skipping frames cancelled while queued.
async fn write_batch(transceiver: &dyn Transceiver, batch: Vec<OutboundFrame>) -> Result<()> {
    let (cancelled, batch): (Vec<_>, Vec<_>) =
        batch.into_iter().partition(OutboundFrame::is_cancelled);
    for frame in cancelled {
        tracing::trace!(size = frame.size(), "skipping cancelled frame");
        frame.complete(Err(RpcError::Cancelled));
    }
    if batch.is_empty() {
        return Ok(());
    }

    let buffers: Vec<Bytes> = batch.iter().map(|frame| frame.bytes.clone()).collect();
    match transceiver.send(&buffers).await {
        Ok(_) => {
            for frame in batch {
                frame.complete(Ok(()));
            }
            Ok(())
        }
        Err(err) => {
            tracing::debug!(transport = %transceiver.description(), error = %err, "write failed");
            for frame in batch {
                frame.complete(Err(err.clone()));
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, StreamTransceiver};
    use tokio::io::{duplex, AsyncReadExt};

    fn spawn_over_duplex() -> (WriterHandle, JoinHandle<Result<()>>, tokio::io::DuplexStream) {
        let (client, server) = duplex(4096);
        let transceiver = Arc::new(StreamTransceiver::new(client, "test"));
        let (handle, task) = spawn_writer_task(transceiver, &WriterConfig::default());
        (handle, task, server)
    }

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending_frames, DEFAULT_MAX_PENDING_FRAMES);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (handle, _task, mut server) = spawn_over_duplex();

        handle.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_writes_in_queue_order() {
        let (handle, _task, mut server) = spawn_over_duplex();

        let mut completions = Vec::new();
        for i in 0..10u8 {
            let slot = handle.reserve().await.unwrap();
            completions.push(handle.enqueue(slot, Bytes::from(vec![i; 3]), None).unwrap());
        }
        for completion in completions {
            completion.await.unwrap().unwrap();
        }

        let mut buf = vec![0u8; 30];
        server.read_exact(&mut buf).await.unwrap();
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 3]).collect();
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_cancelled_frame_is_skipped() {
        let (handle, _task, mut server) = spawn_over_duplex();
        let token = CancellationToken::new();
        token.cancel();

        let slot = handle.reserve().await.unwrap();
        let skipped = handle
            .enqueue(slot, Bytes::from_static(b"skip"), Some(token))
            .unwrap();
        handle.send(Bytes::from_static(b"keep")).await.unwrap();

        assert!(matches!(skipped.await.unwrap(), Err(RpcError::Cancelled)));
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"keep");
    }

    #[tokio::test]
    async fn test_pending_count_and_slots() {
        let (client, _server) = duplex(4096);
        let transceiver = Arc::new(StreamTransceiver::new(client, "test"));
        let config = WriterConfig {
            max_pending_frames: 2,
            max_batch_size: 8,
        };
        let (handle, _task) = spawn_writer_task(transceiver, &config);

        assert_eq!(handle.pending_count(), 0);
        let first = handle.try_reserve().unwrap();
        let _second = handle.try_reserve().unwrap();
        assert_eq!(handle.pending_count(), 2);
        assert!(handle.try_reserve().is_none());

        drop(first);
        assert_eq!(handle.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_close_fails_reservations() {
        let (handle, _task, _server) = spawn_over_duplex();
        handle.close();
        assert!(matches!(
            handle.reserve().await,
            Err(RpcError::ConnectionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let (handle, task, mut server) = spawn_over_duplex();

        let slot = handle.reserve().await.unwrap();
        let completion = handle.enqueue(slot, Bytes::from_static(b"last"), None).unwrap();
        handle.shutdown();

        assert!(task.await.unwrap().is_ok());
        completion.await.unwrap().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"last");
    }

    #[tokio::test]
    async fn test_datagram_frames_are_sent_one_by_one() {
        let (a, b) = MemoryNetwork::datagram_pair();
        let (handle, _task) = spawn_writer_task(Arc::new(a), &WriterConfig::default());

        let first = handle.reserve().await.unwrap();
        let first = handle.enqueue(first, Bytes::from_static(b"one"), None).unwrap();
        handle.send(Bytes::from_static(b"two")).await.unwrap();
        first.await.unwrap().unwrap();

        let mut buf = [0u8; 16];
        let n = b.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = b.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (handle, task, _server) = spawn_over_duplex();

        // Drop the handle to close the channel
        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
