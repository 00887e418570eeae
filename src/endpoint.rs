//! Endpoints and connection keys.
//!
//! An [`Endpoint`] names a destination: transport, host, port, protocol and a
//! few transport options. String form:
//!
//! ```text
//! <transport>://<host>:<port>[?protocol=1|2&compress=true|false&timeout=<ms>&source=<addr>]
//! ```
//!
//! # Example
//!
//! ```
//! use rpcmux::{Endpoint, TransportKind};
//! use rpcmux::protocol::Protocol;
//!
//! let endpoint: Endpoint = "tcp://h1:4062?compress=true".parse().unwrap();
//! assert_eq!(endpoint.transport(), TransportKind::Tcp);
//! assert_eq!(endpoint.port(), 4062);
//! assert_eq!(endpoint.protocol(), Protocol::V2);
//! assert!(endpoint.compress());
//!
//! // Compression does not change identity.
//! let plain: Endpoint = "tcp://h1:4062".parse().unwrap();
//! assert_eq!(endpoint.key(), plain.key());
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::protocol::Protocol;

/// Physical transport of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP; needs an externally supplied connector.
    Ssl,
    /// UDP datagrams.
    Udp,
}

impl TransportKind {
    /// Transport name as written in endpoint strings.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Ssl => "ssl",
            TransportKind::Udp => "udp",
        }
    }

    /// Whether this transport carries datagrams rather than a byte stream.
    #[inline]
    pub fn is_datagram(self) -> bool {
        matches!(self, TransportKind::Udp)
    }
}

impl FromStr for TransportKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "ssl" | "tls" => Ok(TransportKind::Ssl),
            "udp" => Ok(TransportKind::Udp),
            other => Err(RpcError::Config(format!("unknown transport '{}'", other))),
        }
    }
}

/// A destination descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    transport: TransportKind,
    host: String,
    port: u16,
    protocol: Protocol,
    compress: bool,
    timeout: Option<Duration>,
    source_address: Option<String>,
}

impl Endpoint {
    /// Create an endpoint with default options.
    ///
    /// Stream transports default to protocol 2; UDP only speaks protocol 1.
    pub fn new(transport: TransportKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
            protocol: if transport.is_datagram() {
                Protocol::V1
            } else {
                Protocol::V2
            },
            compress: false,
            timeout: None,
            source_address: None,
        }
    }

    /// Shorthand for a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Tcp, host, port)
    }

    /// Shorthand for a UDP endpoint.
    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::new(TransportKind::Udp, host, port)
    }

    /// Set the protocol family.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Request compression of outgoing frames.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Bind outgoing connections to a local address.
    pub fn with_source_address(mut self, source: impl Into<String>) -> Self {
        self.source_address = Some(source.into());
        self
    }

    /// Transport kind.
    #[inline]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Host name or address.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Protocol family.
    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether outgoing frames should be compressed.
    #[inline]
    pub fn compress(&self) -> bool {
        self.compress
    }

    /// Connect timeout.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Local address to bind before connecting.
    #[inline]
    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    /// Whether the transport carries datagrams.
    #[inline]
    pub fn is_datagram(&self) -> bool {
        self.transport.is_datagram()
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Identity used for connection reuse; ignores compression and timeout.
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            transport: self.transport,
            host: self.host.to_ascii_lowercase(),
            port: self.port,
            protocol: self.protocol,
            source_address: self.source_address.clone(),
        }
    }

    /// Whether both endpoints reach the same address, regardless of
    /// transport options. Host names are compared case-insensitively without
    /// name resolution.
    pub fn same_host(&self, other: &Endpoint) -> bool {
        self.port == other.port && self.host.eq_ignore_ascii_case(&other.host)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}?protocol={}",
            self.transport.as_str(),
            self.address(),
            self.protocol
        )?;
        if self.compress {
            write!(f, "&compress=true")?;
        }
        if let Some(timeout) = self.timeout {
            write!(f, "&timeout={}", timeout.as_millis())?;
        }
        if let Some(source) = &self.source_address {
            write!(f, "&source={}", source)?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| RpcError::Config(format!("invalid endpoint '{}': {}", s, why));

        let (transport, rest) = s.split_once("://").ok_or_else(|| bad("missing '://'"))?;
        let transport: TransportKind = transport.parse()?;
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, Some(query)),
            None => (rest, None),
        };
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| bad("missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| bad("invalid port"))?;

        let mut endpoint = Endpoint::new(transport, host, port);
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').ok_or_else(|| bad("option without value"))?;
            match name {
                "protocol" => {
                    endpoint.protocol = match value {
                        "1" => Protocol::V1,
                        "2" => Protocol::V2,
                        _ => return Err(bad("protocol must be 1 or 2")),
                    }
                }
                "compress" => {
                    endpoint.compress = value.parse().map_err(|_| bad("compress must be a bool"))?
                }
                "timeout" => {
                    let ms: u64 = value.parse().map_err(|_| bad("timeout must be milliseconds"))?;
                    endpoint.timeout = Some(Duration::from_millis(ms));
                }
                "source" => endpoint.source_address = Some(value.to_string()),
                other => return Err(bad(&format!("unknown option '{}'", other))),
            }
        }
        if endpoint.is_datagram() && endpoint.protocol != Protocol::V1 {
            return Err(bad("datagram endpoints only support protocol 1"));
        }
        Ok(endpoint)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Endpoint identity for connection lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    transport: TransportKind,
    host: String,
    port: u16,
    protocol: Protocol,
    source_address: Option<String>,
}

/// Composite key for connection reuse: endpoint identity plus connection id.
///
/// A non-empty connection id lets several independent connections to the
/// same endpoint coexist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Endpoint identity.
    pub endpoint: EndpointKey,
    /// Caller-chosen connection id ("" by default).
    pub connection_id: String,
}

impl ConnectionKey {
    /// Build the key for `endpoint` and `connection_id`.
    pub fn new(endpoint: &Endpoint, connection_id: &str) -> Self {
        Self {
            endpoint: endpoint.key(),
            connection_id: connection_id.to_string(),
        }
    }
}
