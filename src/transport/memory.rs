//! In-process network.
//!
//! Endpoints are matched by `host:port`. Connections are tokio duplex pipes,
//! datagram pairs are channels. The network counts dials per address and can
//! refuse chosen addresses, which makes connection establishment observable
//! in tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{Connector, StreamTransceiver, Transceiver};
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError};

/// Buffer size of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = StreamTransceiver<DuplexStream>;

#[derive(Default)]
struct NetworkState {
    listeners: HashMap<String, mpsc::UnboundedSender<Incoming>>,
    refused: HashSet<String>,
    dials: HashMap<String, usize>,
    connect_delay: Option<Duration>,
}

/// An in-process network usable as a [`Connector`].
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork").finish_non_exhaustive()
    }
}

fn address_of(endpoint: &Endpoint) -> String {
    endpoint.address().to_ascii_lowercase()
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start accepting connections for `endpoint`'s address.
    pub fn listen(&self, endpoint: &Endpoint) -> MemoryListener {
        let address = address_of(endpoint);
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().listeners.insert(address.clone(), tx);
        MemoryListener {
            address,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Refuse every connection to `endpoint`'s address.
    pub fn refuse(&self, endpoint: &Endpoint) {
        self.state().refused.insert(address_of(endpoint));
    }

    /// Accept connections to `endpoint`'s address again.
    pub fn unrefuse(&self, endpoint: &Endpoint) {
        self.state().refused.remove(&address_of(endpoint));
    }

    /// Delay every dial, making concurrent dials overlap.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Number of dials made to `endpoint`'s address.
    pub fn dial_count(&self, endpoint: &Endpoint) -> usize {
        self.state()
            .dials
            .get(&address_of(endpoint))
            .copied()
            .unwrap_or(0)
    }

    /// Two connected datagram transceivers.
    pub fn datagram_pair() -> (MemoryDatagram, MemoryDatagram) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryDatagram {
                tx: b_tx,
                rx: tokio::sync::Mutex::new(a_rx),
                description: "memory datagram a".to_string(),
            },
            MemoryDatagram {
                tx: a_tx,
                rx: tokio::sync::Mutex::new(b_rx),
                description: "memory datagram b".to_string(),
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>> {
        let address = address_of(endpoint);
        let delay = {
            let mut state = self.state();
            *state.dials.entry(address.clone()).or_insert(0) += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let refused = || {
            RpcError::transport(
                endpoint.to_string(),
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
            )
        };
        let listener = {
            let state = self.state();
            if state.refused.contains(&address) {
                return Err(refused());
            }
            state.listeners.get(&address).cloned()
        };
        let listener = listener.ok_or_else(refused)?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send(StreamTransceiver::new(server, format!("memory {} <- client", address)))
            .map_err(|_| refused())?;
        tracing::trace!(address = %address, "memory connection established");
        Ok(Arc::new(StreamTransceiver::new(
            client,
            format!("memory -> {}", address),
        )))
    }
}

/// Accepts connections made through a [`MemoryNetwork`].
pub struct MemoryListener {
    address: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
}

impl MemoryListener {
    /// Wait for the next incoming connection.
    pub async fn accept(&self) -> Result<Incoming> {
        self.rx.lock().await.recv().await.ok_or_else(|| {
            RpcError::ConnectionAborted(format!("memory listener {} closed", self.address))
        })
    }
}

/// One side of an in-memory datagram link.
#[derive(Debug)]
pub struct MemoryDatagram {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    description: String,
}

#[async_trait]
impl Transceiver for MemoryDatagram {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, buffers: &[Bytes]) -> Result<usize> {
        let datagram: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();
        let len = datagram.len();
        self.check_send_size(len)?;
        self.tx.send(Bytes::from(datagram)).map_err(|_| {
            RpcError::transport(
                self.description.clone(),
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer dropped"),
            )
        })?;
        Ok(len)
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let datagram = self.rx.lock().await.recv().await.ok_or_else(|| {
            RpcError::transport(
                self.description.clone(),
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer dropped"),
            )
        })?;
        // Truncate like a real datagram socket.
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    async fn close(&self, _reason: &str) -> Result<()> {
        Ok(())
    }

    fn check_send_size(&self, size: usize) -> Result<()> {
        if size > super::MAX_UDP_PAYLOAD {
            return Err(RpcError::FrameTooLarge {
                size,
                max: super::MAX_UDP_PAYLOAD,
            });
        }
        Ok(())
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_accept() {
        let network = MemoryNetwork::new();
        let endpoint = Endpoint::tcp("h1", 4062);
        let listener = network.listen(&endpoint);

        let client = network.connect(&endpoint).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.send(&[Bytes::from_static(b"hi")]).await.unwrap();
        let mut buf = [0u8; 2];
        let mut read = 0;
        while read < 2 {
            read += server.receive(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"hi");
        assert_eq!(network.dial_count(&endpoint), 1);
    }

    #[tokio::test]
    async fn test_refused_and_unknown_addresses() {
        let network = MemoryNetwork::new();
        let h1 = Endpoint::tcp("h1", 4062);
        let _listener = network.listen(&h1);
        network.refuse(&h1);

        assert!(network.connect(&h1).await.is_err());
        assert!(network.connect(&Endpoint::tcp("h2", 4062)).await.is_err());
        assert_eq!(network.dial_count(&h1), 1);

        network.unrefuse(&h1);
        assert!(network.connect(&h1).await.is_ok());
    }

    #[tokio::test]
    async fn test_datagram_pair() {
        let (a, b) = MemoryNetwork::datagram_pair();
        a.send(&[Bytes::from_static(b"one"), Bytes::from_static(b"two")])
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = b.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"onetwo");
    }
}
