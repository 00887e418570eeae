//! Multiplexed connections.
//!
//! A [`Connection`] owns one transceiver and runs the protocol chosen at
//! construction over it:
//! - one writer task: the single FIFO outbound queue (see [`crate::writer`])
//! - one receive task: reads frames and demultiplexes them to streams
//! - an optional idle monitor: keep-alive pings and idle close
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ─► Validating ─► Active ─► Closing ─► Closed
//!                                 └──────abort──────┘
//! ```
//!
//! [`Connection::close`] sends GoAway, refuses new streams, waits for the
//! open streams to drain and then releases the transceiver.
//! [`Connection::abort`] fails every stream and releases the transceiver at
//! once.
//!
//! # Example
//!
//! ```ignore
//! let connection = Connection::connect(transceiver, endpoint, options).await?;
//! let mut stream = connection.create_stream(true)?;
//! stream.send_request(b"payload", true).await?;
//! let (response, _fin) = stream.receive_response().await?;
//! connection.close("done").await?;
//! ```

mod handshake;
mod reader;
mod receive;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backpressure::DispatchLimiter;
use crate::config::ConnectionOptions;
use crate::endpoint::Endpoint;
use crate::error::{Result, RpcError, RetryPolicy};
use crate::protocol::{
    encode_data_frame, encode_go_away, encode_ping, encode_reset, FrameType, GoAwayParams,
    Protocol, StreamRef,
};
use crate::stream::{
    first_stream_id, is_bidirectional, is_client_initiated, request_id_from_stream_id, Stream,
    StreamEvent, CLIENT_CONTROL_STREAM_ID, SERVER_CONTROL_STREAM_ID,
};
use crate::transport::Transceiver;
use crate::writer::{spawn_writer_task, WriteCompletion, WriteSlot, WriterHandle};

use self::reader::FrameReader;

/// Connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Transport connect in progress.
    Connecting,
    /// Handshake in progress.
    Validating,
    /// Streams can be created and accepted.
    Active,
    /// No new streams; existing ones drain.
    Closing,
    /// Transceiver released.
    Closed,
}

/// Callback run in a supervised task for every received heartbeat.
pub type PingObserver = Arc<dyn Fn() + Send + Sync>;

/// Registration of a started, non-control stream.
struct StreamSlot {
    events: mpsc::UnboundedSender<StreamEvent>,
}

struct ConnectionState {
    phase: Phase,
    streams: HashMap<u64, StreamSlot>,
    next_bidirectional: u64,
    next_unidirectional: u64,
    /// Next logical id for a protocol 1 oneway request from the peer.
    next_remote_oneway: u64,
    last_remote_bidirectional: Option<u64>,
    last_remote_unidirectional: Option<u64>,
    peer_max_frame_size: usize,
    idle_timeout: Option<Duration>,
    last_activity: Instant,
    /// Error for operations refused because the connection is shutting down.
    shutdown_error: Option<RpcError>,
    peer_sent_go_away: bool,
    close_started: bool,
}

impl ConnectionState {
    fn refusal(&self) -> RpcError {
        self.shutdown_error
            .clone()
            .unwrap_or_else(RpcError::closed_locally)
    }
}

/// A data frame a stream wants to queue.
pub(crate) struct StreamFrame<'a> {
    pub id: Option<u64>,
    pub bidirectional: bool,
    pub frame_type: FrameType,
    pub payload: &'a [u8],
    pub fin: bool,
    pub compress: bool,
    /// Register the stream so it can receive frames.
    pub register: bool,
    pub cancel: CancellationToken,
}

/// Result of queueing a stream frame.
pub(crate) struct EnqueuedFrame {
    pub id: u64,
    pub events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    pub completion: WriteCompletion,
}

pub(crate) struct ConnectionInner {
    protocol: Protocol,
    endpoint: Endpoint,
    incoming: bool,
    transceiver: Arc<dyn Transceiver>,
    options: ConnectionOptions,
    writer: WriterHandle,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    state: Mutex<ConnectionState>,
    active_streams: watch::Sender<usize>,
    dispatch: DispatchLimiter,
    accept_tx: mpsc::UnboundedSender<Stream>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    shutdown: CancellationToken,
    closed: watch::Sender<Option<RpcError>>,
    ping_observer: Mutex<Option<PingObserver>>,
}

/// A multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner.endpoint.to_string())
            .field("incoming", &self.inner.incoming)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Connection {
    /// Establish an outgoing connection over a connected transceiver.
    pub async fn connect(
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        Self::establish(transceiver, endpoint, options, false).await
    }

    /// Establish an incoming connection over an accepted transceiver.
    pub async fn accept(
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        Self::establish(transceiver, endpoint, options, true).await
    }

    async fn establish(
        transceiver: Arc<dyn Transceiver>,
        endpoint: Endpoint,
        options: ConnectionOptions,
        incoming: bool,
    ) -> Result<Connection> {
        options.validate()?;
        let protocol = endpoint.protocol();
        if transceiver.is_datagram() && protocol != Protocol::V1 {
            return Err(RpcError::NotSupported(
                "datagram transports only support protocol 1".to_string(),
            ));
        }

        let (writer, writer_task) = spawn_writer_task(transceiver.clone(), &options.writer);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let client = !incoming;
        let state = ConnectionState {
            phase: Phase::Connecting,
            streams: HashMap::new(),
            next_bidirectional: first_stream_id(client, true),
            next_unidirectional: first_stream_id(client, false),
            next_remote_oneway: first_stream_id(!client, false),
            last_remote_bidirectional: None,
            last_remote_unidirectional: None,
            peer_max_frame_size: match protocol {
                Protocol::V1 => usize::MAX,
                Protocol::V2 => crate::protocol::DEFAULT_MAX_FRAME_SIZE,
            },
            idle_timeout: options.idle_timeout,
            last_activity: Instant::now(),
            shutdown_error: None,
            peer_sent_go_away: false,
            close_started: false,
        };
        let inner = Arc::new(ConnectionInner {
            protocol,
            endpoint,
            incoming,
            dispatch: DispatchLimiter::from_options(&options),
            transceiver,
            options,
            writer,
            writer_task: Mutex::new(Some(writer_task)),
            state: Mutex::new(state),
            active_streams: watch::channel(0).0,
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown: CancellationToken::new(),
            closed: watch::channel(None).0,
            ping_observer: Mutex::new(None),
        });

        let mut reader = FrameReader::new(
            inner.transceiver.clone(),
            protocol,
            inner.options.max_incoming_frame_size,
        );
        let timeout = inner.options.connect_timeout;
        let established = tokio::time::timeout(timeout, handshake::run(&inner, &mut reader)).await;
        let failure = match established {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_) => Some(RpcError::transport(
                inner.endpoint.to_string(),
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connection establishment timed out"),
            )),
        };
        if let Some(err) = failure {
            tracing::debug!(endpoint = %inner.endpoint, error = %err, "connection establishment failed");
            inner.terminate(err.clone()).await;
            return Err(err);
        }

        inner.set_phase(Phase::Active);
        tracing::debug!(
            endpoint = %inner.endpoint,
            protocol = %protocol,
            incoming,
            transport = %inner.transceiver.description(),
            "connection established"
        );
        tokio::spawn(receive::run(inner.clone(), reader));
        if inner.idle_timeout().is_some() {
            tokio::spawn(handshake::idle_monitor(inner.clone()));
        }
        Ok(Connection { inner })
    }

    /// The endpoint this connection was established for.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Protocol spoken on this connection.
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    /// Whether the peer opened this connection.
    pub fn is_incoming(&self) -> bool {
        self.inner.incoming
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    /// Whether new streams can be created.
    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    /// Negotiated idle timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.idle_timeout()
    }

    /// Largest frame the peer accepts.
    pub fn peer_max_frame_size(&self) -> usize {
        self.inner.state().peer_max_frame_size
    }

    /// Time of the last frame received or data frame sent.
    pub fn last_activity(&self) -> Instant {
        self.inner.state().last_activity
    }

    /// Number of started, unfinished non-control streams.
    pub fn active_stream_count(&self) -> usize {
        *self.inner.active_streams.borrow()
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Install the heartbeat observer.
    pub fn on_ping(&self, observer: impl Fn() + Send + Sync + 'static) {
        *lock(&self.inner.ping_observer) = Some(Arc::new(observer));
    }

    /// Create an outgoing stream. Its id is bound on the first send.
    pub fn create_stream(&self, bidirectional: bool) -> Result<Stream> {
        if bidirectional && self.inner.transceiver.is_datagram() {
            return Err(RpcError::NotSupported(
                "datagram connections only carry unidirectional streams".to_string(),
            ));
        }
        {
            let state = self.inner.state();
            if state.phase != Phase::Active {
                return Err(state.refusal());
            }
        }
        Ok(Stream::outgoing(
            Arc::downgrade(&self.inner),
            self.inner.protocol,
            bidirectional,
            self.inner.endpoint.compress(),
        ))
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut incoming = self.inner.accept_rx.lock().await;
        tokio::select! {
            biased;
            stream = incoming.recv() => match stream {
                Some(stream) => Ok(stream),
                None => Err(self.inner.state().refusal()),
            },
            err = self.closed() => Err(err),
        }
    }

    /// Send a heartbeat. Consumes no stream id.
    pub async fn ping(&self) -> Result<()> {
        self.inner.send_ping().await
    }

    /// Gracefully close the connection.
    ///
    /// Sends GoAway, waits for every non-control stream to finish, then
    /// releases the transceiver. If draining exceeds the close timeout the
    /// connection is aborted and the abort error returned.
    pub async fn close(&self, reason: &str) -> Result<()> {
        self.inner.close(reason).await
    }

    /// Abort the connection: fail every stream with `err` and release the
    /// transceiver immediately. Idempotent.
    pub async fn abort(&self, err: RpcError) {
        self.inner.terminate(err).await;
    }

    /// Wait until the connection is closed and return the reason.
    pub async fn closed(&self) -> RpcError {
        let mut closed = self.inner.closed.subscribe();
        let result = closed.wait_for(Option::is_some).await;
        match result {
            Ok(reason) => reason.clone().unwrap_or_else(RpcError::closed_locally),
            Err(_) => RpcError::closed_locally(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionInner {
    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        lock(&self.state)
    }

    pub(crate) fn writer(&self) -> &WriterHandle {
        &self.writer
    }

    fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    fn idle_timeout(&self) -> Option<Duration> {
        self.state().idle_timeout
    }

    fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    fn local_control_stream_id(&self) -> u64 {
        if self.incoming {
            SERVER_CONTROL_STREAM_ID
        } else {
            CLIENT_CONTROL_STREAM_ID
        }
    }

    fn peer_control_stream_id(&self) -> u64 {
        if self.incoming {
            CLIENT_CONTROL_STREAM_ID
        } else {
            SERVER_CONTROL_STREAM_ID
        }
    }

    /// Whether the peer opened stream `id`.
    fn is_remote(&self, id: u64) -> bool {
        // A server's peer is the client.
        is_client_initiated(id) == self.incoming
    }

    fn publish_active(&self, state: &ConnectionState) {
        self.active_streams.send_replace(state.streams.len());
    }

    /// Encode a stream's data frame, bind its id and queue it, all under the
    /// state lock so ids reach the wire in allocation order.
    pub(crate) fn enqueue_stream_frame(
        &self,
        slot: WriteSlot,
        frame: StreamFrame<'_>,
    ) -> Result<EnqueuedFrame> {
        let mut state = self.state();
        let id = match frame.id {
            Some(id) => {
                if state.phase == Phase::Closed {
                    return Err(state.refusal());
                }
                id
            }
            None => {
                if state.phase != Phase::Active {
                    return Err(state.refusal());
                }
                if frame.bidirectional {
                    state.next_bidirectional
                } else {
                    state.next_unidirectional
                }
            }
        };

        let stream_ref = match self.protocol {
            Protocol::V2 => StreamRef::Id(id),
            Protocol::V1 if is_bidirectional(id) => StreamRef::RequestId(request_id_from_stream_id(id)?),
            Protocol::V1 => StreamRef::RequestId(0),
        };
        let bytes = encode_data_frame(
            self.protocol,
            frame.frame_type,
            stream_ref,
            frame.fin,
            frame.payload,
            frame.compress,
            &self.options.compression,
        )?;
        if bytes.len() > state.peer_max_frame_size {
            return Err(RpcError::FrameTooLarge {
                size: bytes.len(),
                max: state.peer_max_frame_size,
            });
        }
        self.transceiver.check_send_size(bytes.len())?;

        let completion = self.writer.enqueue(slot, bytes, Some(frame.cancel))?;

        if frame.id.is_none() {
            if frame.bidirectional {
                state.next_bidirectional += 4;
            } else {
                state.next_unidirectional += 4;
            }
        }
        let events = if frame.register {
            let (tx, rx) = mpsc::unbounded_channel();
            state.streams.insert(id, StreamSlot { events: tx });
            self.publish_active(&state);
            Some(rx)
        } else {
            None
        };
        state.last_activity = Instant::now();
        tracing::trace!(stream_id = id, frame_type = frame.frame_type.as_str(), fin = frame.fin, "queued stream frame");
        Ok(EnqueuedFrame {
            id,
            events,
            completion,
        })
    }

    pub(crate) fn unregister_stream(&self, id: u64) {
        let mut state = self.state();
        if state.streams.remove(&id).is_some() {
            self.publish_active(&state);
        }
    }

    /// Queue a reset without waiting; skipped when the queue is full.
    pub(crate) fn reset_stream_nowait(&self, id: u64, error_code: u64) {
        if self.state().phase == Phase::Closed {
            return;
        }
        match encode_reset(self.protocol, id, error_code) {
            Ok(frame) => self.send_nowait(frame),
            Err(err) => tracing::debug!(stream_id = id, error = %err, "cannot reset stream"),
        }
    }

    fn send_nowait(&self, frame: Bytes) {
        match self.writer.try_reserve() {
            Some(slot) => {
                let _ = self.writer.enqueue(slot, frame, None);
            }
            None => tracing::debug!("outbound queue full, dropping control frame"),
        }
    }

    async fn send_ping(&self) -> Result<()> {
        {
            let state = self.state();
            if state.phase == Phase::Closed {
                return Err(state.refusal());
            }
        }
        self.writer.send(encode_ping(self.protocol)).await
    }

    fn observe_ping(&self) {
        let Some(observer) = lock(&self.ping_observer).clone() else {
            return;
        };
        let task = tokio::spawn(async move { observer() });
        tokio::spawn(async move {
            if let Err(err) = task.await {
                if err.is_panic() {
                    tracing::error!("ping observer panicked");
                }
            }
        });
    }

    async fn close(&self, reason: &str) -> Result<()> {
        let already_closing = {
            let mut state = self.state();
            if state.phase == Phase::Closed {
                return Ok(());
            }
            let started = state.close_started;
            state.close_started = true;
            state.phase = Phase::Closing;
            if state.shutdown_error.is_none() {
                state.shutdown_error = Some(RpcError::closed_locally());
            }
            started
        };
        if already_closing {
            self.wait_closed().await;
            return Ok(());
        }
        tracing::debug!(endpoint = %self.endpoint, reason, "closing connection");

        // Protocol 2 announces the shutdown first, protocol 1 once drained.
        if self.protocol == Protocol::V2 && !self.transceiver.is_datagram() {
            self.send_go_away(reason).await;
        }

        let mut active = self.active_streams.subscribe();
        let drained = tokio::time::timeout(
            self.options.close_timeout,
            active.wait_for(|count| *count == 0),
        )
        .await
        .is_ok();
        if !drained {
            let err = RpcError::ConnectionAborted(format!(
                "streams did not drain within {:?}",
                self.options.close_timeout
            ));
            tracing::warn!(endpoint = %self.endpoint, "graceful close timed out, aborting");
            self.terminate(err.clone()).await;
            return Err(err);
        }
        if self.state().phase == Phase::Closed {
            return Ok(());
        }

        if self.protocol == Protocol::V1 && !self.transceiver.is_datagram() {
            self.send_go_away(reason).await;
        }

        // Flush the queue before releasing the transceiver.
        self.writer.shutdown();
        let writer_task = lock(&self.writer_task).take();
        if let Some(task) = writer_task {
            if let Ok(Err(err)) = task.await {
                tracing::debug!(error = %err, "writer failed while closing");
            }
        }

        let peer_sent_go_away = self.state().peer_sent_go_away;
        self.terminate(RpcError::ConnectionClosed {
            closed_by_peer: peer_sent_go_away,
            retry: RetryPolicy::NoRetry,
        })
        .await;
        Ok(())
    }

    async fn send_go_away(&self, reason: &str) {
        let params = {
            let state = self.state();
            GoAwayParams {
                last_bidirectional: state.last_remote_bidirectional,
                last_unidirectional: state.last_remote_unidirectional,
                reason: reason.to_string(),
            }
        };
        let result = match encode_go_away(self.protocol, self.local_control_stream_id(), &params) {
            Ok(frame) => self.writer.send(frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::debug!(endpoint = %self.endpoint, error = %err, "failed to send GoAway");
        }
    }

    /// The peer announced its shutdown.
    fn on_peer_go_away(self: &Arc<Self>, params: GoAwayParams) {
        let refused = {
            let mut state = self.state();
            if state.phase >= Phase::Closing && state.peer_sent_go_away {
                return;
            }
            state.peer_sent_go_away = true;
            if state.phase < Phase::Closing {
                state.phase = Phase::Closing;
            }
            state.shutdown_error = Some(RpcError::closed_by_peer(RetryPolicy::Retryable));

            // Streams we opened that the peer never processed.
            let unprocessed: Vec<u64> = state
                .streams
                .keys()
                .copied()
                .filter(|&id| !self.is_remote(id))
                .filter(|&id| {
                    let last = if is_bidirectional(id) {
                        params.last_bidirectional
                    } else {
                        params.last_unidirectional
                    };
                    last.map_or(true, |last| id > last)
                })
                .collect();
            let refused: Vec<StreamSlot> = unprocessed
                .iter()
                .filter_map(|id| state.streams.remove(id))
                .collect();
            self.publish_active(&state);
            refused
        };
        tracing::debug!(
            endpoint = %self.endpoint,
            reason = %params.reason,
            refused = refused.len(),
            "peer sent GoAway"
        );
        for slot in refused {
            let _ = slot.events.send(StreamEvent::Aborted(RpcError::closed_by_peer(
                RetryPolicy::Retryable,
            )));
        }

        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.close("peer closed the connection").await {
                tracing::debug!(error = %err, "close after GoAway failed");
            }
        });
    }

    /// Move to `Closed`: fail remaining streams, stop the tasks and release
    /// the transceiver. Idempotent.
    async fn terminate(&self, err: RpcError) {
        let streams = {
            let mut state = self.state();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            if state.shutdown_error.is_none() {
                state.shutdown_error = Some(err.clone());
            }
            let streams: Vec<StreamSlot> = state.streams.drain().map(|(_, slot)| slot).collect();
            self.publish_active(&state);
            streams
        };
        for slot in streams {
            let _ = slot.events.send(StreamEvent::Aborted(err.clone()));
        }

        self.shutdown.cancel();
        self.dispatch.close();
        self.writer.close();
        if let Some(task) = lock(&self.writer_task).take() {
            task.abort();
        }
        if let Err(close_err) = self.transceiver.close(&err.to_string()).await {
            tracing::debug!(error = %close_err, "transceiver close failed");
        }
        tracing::debug!(endpoint = %self.endpoint, reason = %err, "connection closed");
        self.closed.send_replace(Some(err));
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(Option::is_some).await;
    }
}
