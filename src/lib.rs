//! # rpcmux
//!
//! Connection core for a multi-protocol RPC runtime.
//!
//! This crate moves request and response frames between peers over
//! multiplexed connections speaking one of two wire protocols.
//!
//! ## Architecture
//!
//! - **Codec** ([`protocol`]): protocol 1 (14-byte header, one request per
//!   stream) and protocol 2 (varint header, explicit stream ids)
//! - **Connections** ([`Connection`]): one transceiver, one writer task and
//!   one receive task demultiplexing frames to [`Stream`]s
//! - **Factory** ([`ConnectionFactory`]): shared connections per endpoint with
//!   de-duplicated dials and failover across candidates
//! - **Locator cache** ([`LocatorCache`]): resolution of indirect references
//!   with TTL, single-flight lookups and background refresh
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rpcmux::{ConnectionFactory, FactoryOptions, TcpConnector};
//!
//! #[tokio::main]
//! async fn main() -> rpcmux::Result<()> {
//!     let factory = ConnectionFactory::new(Arc::new(TcpConnector::new()), FactoryOptions::default());
//!     let endpoint = "tcp://127.0.0.1:4061".parse()?;
//!     let connection = factory.get_or_create(&[endpoint], false, "").await?;
//!
//!     let mut stream = connection.create_stream(true)?;
//!     stream.send_request(b"hello", true).await?;
//!     let (response, _fin) = stream.receive_response().await?;
//!     println!("{} bytes", response.payload().len());
//!
//!     factory.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod locator;
pub mod protocol;
pub mod stream;
pub mod transport;
pub mod writer;

mod backpressure;

pub use config::{ConnectionOptions, FactoryOptions, LocatorCacheOptions, RuntimeOptions};
pub use connection::{Connection, Phase};
pub use endpoint::{ConnectionKey, Endpoint, EndpointKey, TransportKind};
pub use error::{Result, RetryPolicy, RpcError};
pub use factory::ConnectionFactory;
pub use locator::{Identity, Locator, LocatorCache, Reference, Target, Ttl};
pub use protocol::{Frame, FrameType, Protocol};
pub use stream::{Stream, StreamState};
pub use transport::{Connector, MemoryNetwork, TcpAcceptor, TcpConnector, Transceiver};
