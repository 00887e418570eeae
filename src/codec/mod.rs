//! Codec module - frame body compression.
//!
//! A frame body is compressed only when:
//! - the endpoint asked for compression,
//! - a [`CompressionCodec`] is installed,
//! - the body is at least [`CompressionSettings::min_size`] bytes.
//!
//! If compressing does not shrink the body, the original is sent with status
//! [`CompressionStatus::CompressResponse`] so the peer still knows a
//! compressed response is welcome.
//!
//! # Example
//!
//! ```
//! use rpcmux::codec::{compress_body, CompressionSettings, Compressed};
//! use rpcmux::protocol::CompressionStatus;
//!
//! // No codec installed: the body is left untouched.
//! let settings = CompressionSettings::default();
//! let out = compress_body(b"payload", true, &settings).unwrap();
//! assert!(matches!(out, Compressed::No(CompressionStatus::NotCompressed)));
//! ```

#[cfg(feature = "zstd")]
mod zstd;

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::protocol::CompressionStatus;

#[cfg(feature = "zstd")]
pub use self::zstd::ZstdCodec;

/// Default minimum body size before compression is attempted (100 bytes).
pub const DEFAULT_COMPRESSION_MIN_SIZE: usize = 100;

/// A compression algorithm usable for frame bodies.
pub trait CompressionCodec: Send + Sync + fmt::Debug {
    /// Codec name for logs.
    fn name(&self) -> &'static str;

    /// Compress `data`.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `data`, which must expand to exactly `uncompressed_len` bytes.
    fn decompress(&self, data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>>;
}

/// Compression configuration shared by all streams of a connection.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CompressionSettings {
    /// Installed codec, if any.
    #[serde(skip)]
    pub codec: Option<Arc<dyn CompressionCodec>>,
    /// Bodies smaller than this are never compressed.
    pub min_size: usize,
}

impl CompressionSettings {
    /// Settings with the given codec and the default threshold.
    pub fn with_codec(codec: Arc<dyn CompressionCodec>) -> Self {
        Self {
            codec: Some(codec),
            min_size: DEFAULT_COMPRESSION_MIN_SIZE,
        }
    }

    /// Settings using the zstd codec.
    #[cfg(feature = "zstd")]
    pub fn zstd() -> Self {
        Self::with_codec(Arc::new(ZstdCodec::default()))
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            codec: None,
            min_size: DEFAULT_COMPRESSION_MIN_SIZE,
        }
    }
}

impl fmt::Debug for CompressionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressionSettings")
            .field("codec", &self.codec.as_ref().map(|c| c.name()))
            .field("min_size", &self.min_size)
            .finish()
    }
}

/// Outcome of [`compress_body`].
#[derive(Debug)]
pub enum Compressed {
    /// The body was compressed.
    Yes(Vec<u8>),
    /// The body is sent as is, with this status.
    No(CompressionStatus),
}

/// Apply the compression policy to a frame body.
pub fn compress_body(
    body: &[u8],
    requested: bool,
    settings: &CompressionSettings,
) -> Result<Compressed> {
    let Some(codec) = settings.codec.as_ref().filter(|_| requested) else {
        return Ok(Compressed::No(CompressionStatus::NotCompressed));
    };
    if body.len() < settings.min_size {
        return Ok(Compressed::No(CompressionStatus::CompressResponse));
    }
    let compressed = codec.compress(body)?;
    if compressed.len() >= body.len() {
        tracing::trace!(
            codec = codec.name(),
            size = body.len(),
            "compression did not shrink body, sending uncompressed"
        );
        return Ok(Compressed::No(CompressionStatus::CompressResponse));
    }
    Ok(Compressed::Yes(compressed))
}

/// Decompress a body received with status [`CompressionStatus::Compressed`].
pub fn decompress_body(
    body: &[u8],
    uncompressed_len: usize,
    settings: &CompressionSettings,
) -> Result<Vec<u8>> {
    let codec = settings
        .codec
        .as_ref()
        .ok_or(RpcError::UnsupportedCompression)?;
    let data = codec.decompress(body, uncompressed_len)?;
    if data.len() != uncompressed_len {
        return Err(RpcError::Protocol(format!(
            "decompressed size {} does not match announced size {}",
            data.len(),
            uncompressed_len
        )));
    }
    Ok(data)
}
