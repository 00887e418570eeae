//! Connection validation and the idle monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::reader::FrameReader;
use super::{ConnectionInner, Phase};
use crate::error::{Result, RetryPolicy, RpcError};
use crate::protocol::{
    decode_frame, encode_initialize, DecodedFrame, FrameType, InitializeParams, Protocol,
    V2_PROTOCOL_VERSION,
};

/// Connect the transceiver and exchange the validation frames.
///
/// - protocol 1: the server sends ValidateConnection, the client waits for it
/// - protocol 2: both sides send Initialize on their control stream, the
///   client first
/// - datagram transports skip validation
pub(super) async fn run(inner: &Arc<ConnectionInner>, reader: &mut FrameReader) -> Result<()> {
    inner.transceiver.connect().await?;
    inner.set_phase(Phase::Validating);
    if inner.transceiver.is_datagram() {
        return Ok(());
    }

    match (inner.protocol, inner.incoming) {
        (Protocol::V1, true) => send_initialize(inner).await,
        (Protocol::V1, false) => {
            expect_initialize(inner, reader).await?;
            Ok(())
        }
        (Protocol::V2, false) => {
            send_initialize(inner).await?;
            let params = expect_initialize(inner, reader).await?;
            apply_peer_params(inner, params)
        }
        (Protocol::V2, true) => {
            let params = expect_initialize(inner, reader).await?;
            apply_peer_params(inner, params)?;
            send_initialize(inner).await
        }
    }
}

fn local_params(inner: &ConnectionInner) -> InitializeParams {
    InitializeParams {
        version: V2_PROTOCOL_VERSION,
        max_frame_size: inner.options.max_incoming_frame_size as u64,
        idle_timeout_ms: inner
            .options
            .idle_timeout
            .map_or(0, |idle| idle.as_millis() as u64),
    }
}

async fn send_initialize(inner: &ConnectionInner) -> Result<()> {
    let frame = encode_initialize(
        inner.protocol,
        inner.local_control_stream_id(),
        &local_params(inner),
    )?;
    inner.writer.send(frame).await
}

async fn expect_initialize(
    inner: &ConnectionInner,
    reader: &mut FrameReader,
) -> Result<Option<InitializeParams>> {
    let raw = reader
        .next_frame()
        .await?
        .ok_or_else(|| RpcError::closed_by_peer(RetryPolicy::Retryable))?;
    match decode_frame(raw, &inner.options.compression, inner.options.max_incoming_frame_size)? {
        DecodedFrame::Initialize { stream_id, params } => {
            if inner.protocol == Protocol::V2 && stream_id != Some(inner.peer_control_stream_id()) {
                return Err(RpcError::Protocol(format!(
                    "Initialize on stream {:?} instead of the peer control stream",
                    stream_id
                )));
            }
            Ok(params)
        }
        other => Err(RpcError::UnexpectedFrameType {
            expected: FrameType::Initialize.as_str(),
            received: other.type_name(),
        }),
    }
}

fn apply_peer_params(inner: &ConnectionInner, params: Option<InitializeParams>) -> Result<()> {
    let params = params.ok_or_else(|| {
        RpcError::Protocol("Initialize frame without parameters".to_string())
    })?;
    if params.version != V2_PROTOCOL_VERSION {
        return Err(RpcError::Protocol(format!(
            "unsupported protocol version {}",
            params.version
        )));
    }
    if params.max_frame_size == 0 {
        return Err(RpcError::Protocol("peer advertised a zero max frame size".to_string()));
    }

    let mut state = inner.state();
    state.peer_max_frame_size = usize::try_from(params.max_frame_size).unwrap_or(usize::MAX);
    let peer_idle = (params.idle_timeout_ms > 0).then(|| Duration::from_millis(params.idle_timeout_ms));
    state.idle_timeout = match (state.idle_timeout, peer_idle) {
        (Some(local), Some(peer)) => Some(local.min(peer)),
        (local, peer) => local.or(peer),
    };
    tracing::debug!(
        peer_max_frame_size = state.peer_max_frame_size,
        idle_timeout = ?state.idle_timeout,
        "applied peer parameters"
    );
    Ok(())
}

/// Keep-alive and idle close.
///
/// Ticks every half idle period. With keep-alive enabled a heartbeat is sent
/// on each tick and the connection is never closed for inactivity; otherwise
/// an active connection with no open stream and no traffic for the idle
/// period is closed gracefully.
pub(super) async fn idle_monitor(inner: Arc<ConnectionInner>) {
    let Some(idle) = inner.idle_timeout() else {
        return;
    };
    let period = (idle / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = inner.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if inner.options.keep_alive {
            if let Err(err) = inner.send_ping().await {
                tracing::debug!(error = %err, "heartbeat failed");
                return;
            }
            continue;
        }
        let idle_now = {
            let state = inner.state();
            state.phase == Phase::Active
                && state.streams.is_empty()
                && state.last_activity.elapsed() >= idle
        };
        if idle_now {
            tracing::debug!(endpoint = %inner.endpoint, ?idle, "closing idle connection");
            if let Err(err) = inner.close("connection idle").await {
                tracing::debug!(error = %err, "idle close failed");
            }
            return;
        }
    }
}
