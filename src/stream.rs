//! Logical streams multiplexed over a connection.
//!
//! # Numbering
//!
//! Stream ids follow the QUIC scheme on both protocols:
//!
//! | `id % 4` | initiator | direction |
//! |----------|-----------|-----------|
//! | 0 | client | bidirectional |
//! | 1 | server | bidirectional |
//! | 2 | client | unidirectional |
//! | 3 | server | unidirectional |
//!
//! Ids 2 and 3 are the control streams carrying the handshake and GoAway.
//! Protocol 1 only has a 32-bit request id on the wire; the stream id is
//! recovered as `((request_id - 1) << 2) + parity`, with request id 0 marking
//! a oneway request whose unidirectional id is allocated locally.
//!
//! # States
//!
//! ```text
//! Unstarted ──first send──► Started ──local fin──► HalfClosedLocal ──┐
//!                              │                                     ├──► Closed
//!                              └─────remote fin──► HalfClosedRemote ─┘
//! any ──reset / connection abort──► Aborted
//! ```
//!
//! An outgoing stream gets its id on the first send, so streams that never
//! send do not consume id space.

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backpressure::DispatchPermit;
use crate::connection::{ConnectionInner, StreamFrame};
use crate::error::{Result, RpcError};
use crate::protocol::{encode_reset, Frame, FrameType, Protocol};

/// Client control stream id.
pub const CLIENT_CONTROL_STREAM_ID: u64 = 2;

/// Server control stream id.
pub const SERVER_CONTROL_STREAM_ID: u64 = 3;

/// Reset code sent when a stream is cancelled or dropped before completion.
pub const CANCELLED_ERROR_CODE: u64 = 0;

/// Whether `id` names a bidirectional stream.
#[inline]
pub fn is_bidirectional(id: u64) -> bool {
    id & 0b10 == 0
}

/// Whether `id` names a client-initiated stream.
#[inline]
pub fn is_client_initiated(id: u64) -> bool {
    id & 0b01 == 0
}

/// Whether `id` is one of the two control streams.
#[inline]
pub fn is_control(id: u64) -> bool {
    id == CLIENT_CONTROL_STREAM_ID || id == SERVER_CONTROL_STREAM_ID
}

/// First id a side allocates for a stream kind; unidirectional allocation
/// skips the control stream.
pub(crate) fn first_stream_id(client: bool, bidirectional: bool) -> u64 {
    let parity = if client { 0 } else { 1 };
    if bidirectional {
        parity
    } else {
        CLIENT_CONTROL_STREAM_ID + parity + 4
    }
}

/// Map a positive protocol 1 request id to a bidirectional stream id.
pub fn stream_id_from_request_id(request_id: i32, client_initiated: bool) -> u64 {
    debug_assert!(request_id > 0);
    let parity = if client_initiated { 0 } else { 1 };
    ((request_id as u64 - 1) << 2) + parity
}

/// Map a bidirectional stream id back to its protocol 1 request id.
pub fn request_id_from_stream_id(id: u64) -> Result<i32> {
    i32::try_from((id >> 2) + 1)
        .map_err(|_| RpcError::Protocol(format!("stream {} exceeds the request id range", id)))
}

/// Observable stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No id bound yet.
    Unstarted,
    /// Id bound, both directions open.
    Started,
    /// Local side sent its last frame.
    HalfClosedLocal,
    /// Remote side sent its last frame.
    HalfClosedRemote,
    /// Both directions finished.
    Closed,
    /// Reset or aborted.
    Aborted,
}

/// What the connection delivers to a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data { frame: Frame, fin: bool },
    Reset { error_code: u64 },
    Aborted(RpcError),
}

/// One logical request/response channel.
///
/// Streams keep only a weak reference to their connection. Dropping a stream
/// unregisters it, releases its dispatch permit and, on protocol 2, resets
/// it if it was not finished.
pub struct Stream {
    id: Option<u64>,
    bidirectional: bool,
    incoming: bool,
    protocol: Protocol,
    local_done: bool,
    remote_done: bool,
    aborted: Option<RpcError>,
    registered: bool,
    compress: bool,
    connection: Weak<ConnectionInner>,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    cancel: CancellationToken,
    _permit: Option<DispatchPermit>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("bidirectional", &self.bidirectional)
            .field("incoming", &self.incoming)
            .field("state", &self.state())
            .finish()
    }
}

impl Stream {
    pub(crate) fn outgoing(
        connection: Weak<ConnectionInner>,
        protocol: Protocol,
        bidirectional: bool,
        compress: bool,
    ) -> Self {
        Self {
            id: None,
            bidirectional,
            incoming: false,
            protocol,
            local_done: false,
            remote_done: !bidirectional,
            aborted: None,
            registered: false,
            compress,
            connection,
            events: None,
            cancel: CancellationToken::new(),
            _permit: None,
        }
    }

    pub(crate) fn incoming(
        connection: Weak<ConnectionInner>,
        protocol: Protocol,
        id: u64,
        events: mpsc::UnboundedReceiver<StreamEvent>,
        compress: bool,
        permit: Option<DispatchPermit>,
    ) -> Self {
        let bidirectional = is_bidirectional(id);
        Self {
            id: Some(id),
            bidirectional,
            incoming: true,
            protocol,
            local_done: !bidirectional,
            remote_done: false,
            aborted: None,
            registered: true,
            compress,
            connection,
            events: Some(events),
            cancel: CancellationToken::new(),
            _permit: permit,
        }
    }

    /// Stream id, once bound.
    #[inline]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Whether the stream carries a response.
    #[inline]
    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Whether the peer opened this stream.
    #[inline]
    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        if self.aborted.is_some() {
            return StreamState::Aborted;
        }
        if self.id.is_none() {
            return StreamState::Unstarted;
        }
        match (self.local_done, self.remote_done) {
            (false, false) => StreamState::Started,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (true, true) => StreamState::Closed,
        }
    }

    /// Token cancelling this stream's pending and future operations.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Send a request frame on an outgoing stream.
    pub async fn send_request(&mut self, payload: &[u8], fin: bool) -> Result<()> {
        if self.incoming {
            return Err(RpcError::NotSupported(
                "send_request on an incoming stream".to_string(),
            ));
        }
        self.send(FrameType::Request, payload, fin).await
    }

    /// Send a response frame on an incoming bidirectional stream.
    pub async fn send_response(&mut self, payload: &[u8], fin: bool) -> Result<()> {
        if !self.incoming || !self.bidirectional {
            return Err(RpcError::NotSupported(
                "send_response needs an incoming bidirectional stream".to_string(),
            ));
        }
        self.send(FrameType::Response, payload, fin).await
    }

    /// Receive the next request frame of an incoming stream.
    pub async fn receive_request(&mut self) -> Result<(Frame, bool)> {
        self.receive(FrameType::Request).await
    }

    /// Receive the next response frame of an outgoing stream.
    pub async fn receive_response(&mut self) -> Result<(Frame, bool)> {
        if self.incoming {
            return Err(RpcError::NotSupported(
                "receive_response on an incoming stream".to_string(),
            ));
        }
        self.receive(FrameType::Response).await
    }

    /// Abort the stream and tell the peer.
    ///
    /// Protocol 1 has no reset frame and fails with `NotSupported`.
    pub async fn reset(&mut self, error_code: u64) -> Result<()> {
        if !self.protocol.supports_stream_reset() {
            return Err(RpcError::NotSupported(
                "stream reset is not supported by protocol 1".to_string(),
            ));
        }
        if self.aborted.is_some() {
            return Ok(());
        }
        self.abort_locally(RpcError::StreamAborted { error_code });
        if let (Some(id), Some(connection)) = (self.id, self.connection.upgrade()) {
            let frame = encode_reset(self.protocol, id, error_code)?;
            connection.writer().send(frame).await?;
        }
        Ok(())
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>> {
        self.connection
            .upgrade()
            .ok_or_else(RpcError::closed_locally)
    }

    async fn send(&mut self, frame_type: FrameType, payload: &[u8], fin: bool) -> Result<()> {
        if let Some(err) = &self.aborted {
            return Err(err.clone());
        }
        if self.local_done {
            return Err(RpcError::Protocol(
                "stream already sent its last frame".to_string(),
            ));
        }
        if self.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        let connection = self.connection()?;

        let slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(RpcError::Cancelled),
            slot = connection.writer().reserve() => slot?,
        };
        let closes = fin && self.remote_done;
        let enqueued = connection.enqueue_stream_frame(
            slot,
            StreamFrame {
                id: self.id,
                bidirectional: self.bidirectional,
                frame_type,
                payload,
                fin,
                compress: self.compress,
                register: self.id.is_none() && !closes,
                cancel: self.cancel.clone(),
            },
        )?;
        drop(connection);

        self.id = Some(enqueued.id);
        if let Some(events) = enqueued.events {
            self.events = Some(events);
            self.registered = true;
        }
        if fin {
            self.local_done = true;
        }

        let result = match enqueued.completion.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::closed_locally()),
        };
        match result {
            Ok(()) => {
                self.unregister_if_closed();
                Ok(())
            }
            // Skipped by the writer; the peer may already hold earlier frames.
            Err(RpcError::Cancelled) => {
                self.on_cancelled();
                Err(RpcError::Cancelled)
            }
            Err(err) => {
                self.abort_locally(err.clone());
                Err(err)
            }
        }
    }

    async fn receive(&mut self, expected: FrameType) -> Result<(Frame, bool)> {
        if let Some(err) = &self.aborted {
            return Err(err.clone());
        }
        if self.remote_done {
            return Err(RpcError::Protocol(
                "stream already received its last frame".to_string(),
            ));
        }
        let cancel = self.cancel.clone();
        let Some(events) = self.events.as_mut() else {
            return Err(RpcError::NotSupported(
                "receive on a stream that has not sent anything".to_string(),
            ));
        };

        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.on_cancelled();
                return Err(RpcError::Cancelled);
            }
            event = events.recv() => event,
        };

        match event {
            Some(StreamEvent::Data { frame, fin }) => {
                if frame.frame_type != expected {
                    let err = RpcError::UnexpectedFrameType {
                        expected: expected.as_str(),
                        received: frame.frame_type.as_str(),
                    };
                    self.abort_locally(err.clone());
                    return Err(err);
                }
                if fin {
                    self.remote_done = true;
                    self.unregister_if_closed();
                }
                if self.incoming && frame.wants_compressed_response() {
                    self.compress = true;
                }
                Ok((frame, fin))
            }
            Some(StreamEvent::Reset { error_code }) => {
                let err = RpcError::StreamAborted { error_code };
                self.abort_locally(err.clone());
                Err(err)
            }
            Some(StreamEvent::Aborted(err)) => {
                self.abort_locally(err.clone());
                Err(err)
            }
            None => {
                let err = RpcError::closed_locally();
                self.abort_locally(err.clone());
                Err(err)
            }
        }
    }

    /// A receive or queued send was cancelled: reset on protocol 2, fail
    /// locally on protocol 1.
    fn on_cancelled(&mut self) {
        let id = self.id;
        self.abort_locally(RpcError::Cancelled);
        if let (true, Some(id)) = (self.protocol.supports_stream_reset(), id) {
            if let Some(connection) = self.connection.upgrade() {
                connection.reset_stream_nowait(id, CANCELLED_ERROR_CODE);
            }
        }
    }

    fn abort_locally(&mut self, err: RpcError) {
        if self.aborted.is_none() {
            tracing::trace!(stream_id = ?self.id, error = %err, "stream aborted");
            self.aborted = Some(err);
        }
        self.unregister();
    }

    fn unregister_if_closed(&mut self) {
        if self.local_done && self.remote_done {
            self.unregister();
        }
    }

    fn unregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let (Some(id), Some(connection)) = (self.id, self.connection.upgrade()) {
            connection.unregister_stream(id);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let unfinished = self.aborted.is_none() && !(self.local_done && self.remote_done);
        if let (true, true, Some(id)) = (
            unfinished,
            self.protocol.supports_stream_reset(),
            self.id,
        ) {
            if let Some(connection) = self.connection.upgrade() {
                connection.reset_stream_nowait(id, CANCELLED_ERROR_CODE);
            }
        }
        self.unregister();
    }
}
