//! Connected UDP transceiver.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use super::Transceiver;
use crate::error::{Result, RpcError};

/// Largest UDP payload over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// A UDP socket connected to a single peer.
#[derive(Debug)]
pub struct UdpTransceiver {
    socket: UdpSocket,
    description: String,
}

impl UdpTransceiver {
    /// Bind to `local` and connect to `peer`.
    pub async fn connect(local: &str, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|err| RpcError::transport(format!("udp bind {}", local), err))?;
        socket
            .connect(peer)
            .await
            .map_err(|err| RpcError::transport(format!("udp connect {}", peer), err))?;
        Ok(Self::from_socket(socket, peer))
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket, peer: SocketAddr) -> Self {
        let local = socket
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Self {
            socket,
            description: format!("udp {} -> {}", local, peer),
        }
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| RpcError::transport(self.description.clone(), err))
    }
}

#[async_trait]
impl Transceiver for UdpTransceiver {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, buffers: &[Bytes]) -> Result<usize> {
        let datagram: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();
        self.check_send_size(datagram.len())?;
        self.socket
            .send(&datagram)
            .await
            .map_err(|err| RpcError::transport(self.description.clone(), err))
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.socket
            .recv(buf)
            .await
            .map_err(|err| RpcError::transport(self.description.clone(), err))
    }

    async fn close(&self, _reason: &str) -> Result<()> {
        Ok(())
    }

    fn check_send_size(&self, size: usize) -> Result<()> {
        if size > MAX_UDP_PAYLOAD {
            return Err(RpcError::FrameTooLarge {
                size,
                max: MAX_UDP_PAYLOAD,
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
