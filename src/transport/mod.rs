//! Transport module - byte-stream and datagram transceivers.
//!
//! The connection core only talks to the [`Transceiver`] trait. Concrete
//! transports:
//! - [`StreamTransceiver`]: any tokio `AsyncRead + AsyncWrite` (TCP, in-memory)
//! - [`UdpTransceiver`]: connected UDP socket
//! - [`MemoryNetwork`]: in-process network for tests and embedding
//!
//! A [`Connector`] turns an [`Endpoint`] into a connected transceiver.

mod memory;
mod stream;
mod tcp;
mod udp;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::Endpoint;
use crate::error::Result;

pub use memory::{MemoryDatagram, MemoryListener, MemoryNetwork};
pub use stream::StreamTransceiver;
pub use tcp::{TcpAcceptor, TcpConnector};
pub use udp::{UdpTransceiver, MAX_UDP_PAYLOAD};

/// A raw byte or datagram transport.
///
/// Sends are serialized by the connection's writer task and receives by its
/// receive loop, so implementations only need interior mutability for the
/// two directions independently.
#[async_trait]
pub trait Transceiver: Send + Sync + fmt::Debug {
    /// Finish transport-level establishment (e.g. a TLS handshake).
    async fn connect(&self) -> Result<()>;

    /// Write all buffers and return the number of bytes sent.
    ///
    /// On a datagram transport the buffers form a single datagram.
    async fn send(&self, buffers: &[Bytes]) -> Result<usize>;

    /// Read into `buf` and return the number of bytes read; 0 means end of
    /// stream. On a datagram transport one call returns one datagram.
    async fn receive(&self, buf: &mut [u8]) -> Result<usize>;

    /// Shut the transport down.
    async fn close(&self, reason: &str) -> Result<()>;

    /// Fail if a frame of `size` bytes can never be sent.
    fn check_send_size(&self, size: usize) -> Result<()>;

    /// Whether this transport carries datagrams.
    fn is_datagram(&self) -> bool;

    /// Human-readable description for logs and errors.
    fn description(&self) -> String;
}

/// Establishes outgoing transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transceiver to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>>;
}
