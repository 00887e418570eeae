//! TCP listener and connector.
//!
//! # Example
//!
//! ```ignore
//! use rpcmux::transport::{Connector, TcpAcceptor, TcpConnector};
//! use rpcmux::Endpoint;
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
//! let port = acceptor.local_addr()?.port();
//!
//! let connector = TcpConnector::new();
//! let transceiver = connector.connect(&Endpoint::tcp("127.0.0.1", port)).await?;
//! let (incoming, _peer) = acceptor.accept().await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::{Connector, StreamTransceiver, Transceiver, UdpTransceiver};
use crate::endpoint::{Endpoint, TransportKind};
use crate::error::{Result, RpcError};

/// TCP listener producing incoming transceivers.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to an address such as `127.0.0.1:0`.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| RpcError::transport(format!("tcp bind {}", addr), err))?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(StreamTransceiver<TcpStream>, SocketAddr)> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|err| RpcError::transport("tcp accept", err))?;
        let _ = stream.set_nodelay(true);
        let description = format!("tcp {} <- {}", self.local_description(), peer);
        Ok((StreamTransceiver::new(stream, description), peer))
    }

    /// Get the bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|err| RpcError::transport("tcp local_addr", err))
    }

    fn local_description(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "?".to_string())
    }
}

/// Connector for `tcp` and `udp` endpoints.
///
/// `ssl` endpoints need a connector that wraps the TCP stream in TLS; this one
/// rejects them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl TcpConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }

    async fn connect_tcp(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>> {
        let context = endpoint.to_string();
        let stream = match endpoint.source_address() {
            Some(source) => {
                let target = resolve(endpoint).await?;
                let source: SocketAddr = format!("{}:0", source).parse().map_err(|_| {
                    RpcError::Config(format!("invalid source address '{}'", source))
                })?;
                let socket = if target.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(|err| RpcError::transport(context.clone(), err))?;
                socket
                    .bind(source)
                    .map_err(|err| RpcError::transport(context.clone(), err))?;
                socket
                    .connect(target)
                    .await
                    .map_err(|err| RpcError::transport(context.clone(), err))?
            }
            None => TcpStream::connect(endpoint.address())
                .await
                .map_err(|err| RpcError::transport(context.clone(), err))?,
        };
        let _ = stream.set_nodelay(true);
        Ok(Arc::new(StreamTransceiver::new(stream, format!("tcp -> {}", endpoint.address()))))
    }
}

async fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint.address())
        .await
        .map_err(|err| RpcError::transport(endpoint.to_string(), err))?
        .next()
        .ok_or_else(|| RpcError::transport(
            endpoint.to_string(),
            std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve"),
        ))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transceiver>> {
        match endpoint.transport() {
            TransportKind::Tcp => self.connect_tcp(endpoint).await,
            TransportKind::Udp => {
                let target = resolve(endpoint).await?;
                let local = match endpoint.source_address() {
                    Some(source) => format!("{}:0", source),
                    None if target.is_ipv4() => "0.0.0.0:0".to_string(),
                    None => "[::]:0".to_string(),
                };
                let transceiver = UdpTransceiver::connect(&local, target).await?;
                Ok(Arc::new(transceiver))
            }
            TransportKind::Ssl => Err(RpcError::NotSupported(format!(
                "{}: ssl endpoints need a TLS connector",
                endpoint
            ))),
        }
    }
}
