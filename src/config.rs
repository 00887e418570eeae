//! Runtime configuration.
//!
//! Every options struct has a `Default` impl and builder-style setters, and
//! deserializes from JSON with missing fields falling back to the defaults.
//! Durations are given in milliseconds.
//!
//! # Example
//!
//! ```
//! use rpcmux::config::RuntimeOptions;
//!
//! let options = RuntimeOptions::from_json(r#"{
//!     "connection": { "idle_timeout": 30000, "serialize_dispatch": true },
//!     "locator_cache": { "ttl": -1, "background_refresh": true }
//! }"#).unwrap();
//!
//! assert_eq!(options.connection.idle_timeout.unwrap().as_secs(), 30);
//! assert!(options.locator_cache.background_refresh);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::codec::CompressionSettings;
use crate::error::{Result, RpcError};
use crate::locator::Ttl;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::WriterConfig;

/// Default idle timeout (60 seconds).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for transport connect plus handshake (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a graceful close waits for streams to drain (10 seconds).
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a failed endpoint is deprioritized (5 seconds).
pub const DEFAULT_FAILURE_EXPIRY: Duration = Duration::from_secs(5);

/// Per-connection options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Close the connection after this long without activity. `None` disables
    /// the idle monitor.
    #[serde(with = "millis_opt")]
    pub idle_timeout: Option<Duration>,
    /// Send heartbeats every half idle period.
    pub keep_alive: bool,
    /// Largest incoming frame accepted, header included.
    pub max_incoming_frame_size: usize,
    /// Dispatch one incoming stream of each kind at a time.
    pub serialize_dispatch: bool,
    /// Maximum concurrently dispatched incoming bidirectional streams.
    pub max_bidirectional_streams: Option<usize>,
    /// Maximum concurrently dispatched incoming unidirectional streams.
    pub max_unidirectional_streams: Option<usize>,
    /// Bound on transport connect plus validation.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Bound on a graceful close; the connection is aborted afterwards.
    #[serde(with = "millis")]
    pub close_timeout: Duration,
    /// Frame body compression.
    pub compression: CompressionSettings,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            keep_alive: false,
            max_incoming_frame_size: DEFAULT_MAX_FRAME_SIZE,
            serialize_dispatch: false,
            max_bidirectional_streams: None,
            max_unidirectional_streams: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            compression: CompressionSettings::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionOptions {
    /// Set or disable the idle timeout.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable heartbeats.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Set the incoming frame size limit.
    pub fn max_incoming_frame_size(mut self, size: usize) -> Self {
        self.max_incoming_frame_size = size;
        self
    }

    /// Dispatch incoming streams one at a time.
    pub fn serialize_dispatch(mut self, enabled: bool) -> Self {
        self.serialize_dispatch = enabled;
        self
    }

    /// Limit concurrently dispatched incoming bidirectional streams.
    pub fn max_bidirectional_streams(mut self, limit: usize) -> Self {
        self.max_bidirectional_streams = Some(limit);
        self
    }

    /// Limit concurrently dispatched incoming unidirectional streams.
    pub fn max_unidirectional_streams(mut self, limit: usize) -> Self {
        self.max_unidirectional_streams = Some(limit);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the close timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set compression settings.
    pub fn compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression;
        self
    }

    /// Dispatch limit for one stream kind: `serialize_dispatch` wins over the
    /// explicit limits.
    pub(crate) fn dispatch_limit(&self, bidirectional: bool) -> Option<usize> {
        if self.serialize_dispatch {
            return Some(1);
        }
        if bidirectional {
            self.max_bidirectional_streams
        } else {
            self.max_unidirectional_streams
        }
    }

    /// Check option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_incoming_frame_size < crate::protocol::V1_HEADER_SIZE {
            return Err(RpcError::Config(format!(
                "max_incoming_frame_size {} is smaller than a frame header",
                self.max_incoming_frame_size
            )));
        }
        if self.max_bidirectional_streams == Some(0) || self.max_unidirectional_streams == Some(0)
        {
            return Err(RpcError::Config(
                "stream limits must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(RpcError::Config(
                "idle_timeout must be positive, use null to disable".to_string(),
            ));
        }
        self.writer.validate()
    }
}

/// Connection factory options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FactoryOptions {
    /// How long a failed endpoint is tried after the others.
    #[serde(with = "millis")]
    pub failure_expiry: Duration,
    /// Options for every connection the factory creates.
    pub connection: ConnectionOptions,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            failure_expiry: DEFAULT_FAILURE_EXPIRY,
            connection: ConnectionOptions::default(),
        }
    }
}

impl FactoryOptions {
    /// Set the failure expiry.
    pub fn failure_expiry(mut self, expiry: Duration) -> Self {
        self.failure_expiry = expiry;
        self
    }

    /// Set the connection options.
    pub fn connection(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }
}

/// Locator cache options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocatorCacheOptions {
    /// Default cache lifetime; seconds in JSON, `-1` for infinite and `0` to
    /// disable.
    pub ttl: Ttl,
    /// Serve stale entries while refreshing them in the background.
    pub background_refresh: bool,
}

impl LocatorCacheOptions {
    /// Set the default TTL.
    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable background refresh.
    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = enabled;
        self
    }
}

/// All runtime options in one document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Connection options, used by the factory as well.
    pub connection: ConnectionOptions,
    /// Factory options other than the connection options.
    pub factory: FactoryOptions,
    /// Locator cache options.
    pub locator_cache: LocatorCacheOptions,
}

impl RuntimeOptions {
    /// Parse and validate options from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut options: RuntimeOptions = serde_json::from_str(json)?;
        options.factory.connection = options.connection.clone();
        options.connection.validate()?;
        Ok(options)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
