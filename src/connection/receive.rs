//! Receive loop: decode inbound frames and route them to streams.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::reader::FrameReader;
use super::{ConnectionInner, Phase, StreamSlot};
use crate::error::{Result, RetryPolicy, RpcError};
use crate::protocol::{decode_frame, encode_pong, DecodedFrame, Frame, FrameType, Protocol, StreamRef};
use crate::stream::{is_bidirectional, is_control, stream_id_from_request_id, Stream, StreamEvent};

pub(super) async fn run(inner: Arc<ConnectionInner>, mut reader: FrameReader) {
    let shutdown = inner.shutdown.clone();
    let result = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = receive_frames(&inner, &mut reader) => result,
    };
    let err = match result {
        Ok(()) => {
            tracing::debug!(endpoint = %inner.endpoint, "peer closed the transport");
            RpcError::ConnectionClosed {
                closed_by_peer: true,
                retry: RetryPolicy::NoRetry,
            }
        }
        Err(err) => {
            tracing::warn!(endpoint = %inner.endpoint, error = %err, "receive loop failed");
            err
        }
    };
    inner.terminate(err).await;
}

async fn receive_frames(inner: &Arc<ConnectionInner>, reader: &mut FrameReader) -> Result<()> {
    let datagram = inner.transceiver.is_datagram();
    while let Some(raw) = reader.next_frame().await? {
        let result = match decode_frame(
            raw,
            &inner.options.compression,
            inner.options.max_incoming_frame_size,
        ) {
            Ok(frame) => process_frame(inner, frame).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {}
            Err(err) if datagram => {
                tracing::warn!(error = %err, "discarding datagram");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn process_frame(inner: &Arc<ConnectionInner>, frame: DecodedFrame) -> Result<()> {
    inner.state().last_activity = Instant::now();
    tracing::trace!(frame_type = frame.type_name(), "received frame");
    match frame {
        DecodedFrame::Data { stream, frame, fin } => route_data(inner, stream, frame, fin).await,
        DecodedFrame::Initialize { .. } => match inner.protocol {
            // ValidateConnection doubles as the protocol 1 heartbeat.
            Protocol::V1 => {
                inner.observe_ping();
                Ok(())
            }
            Protocol::V2 => Err(RpcError::Protocol(
                "Initialize received after the handshake".to_string(),
            )),
        },
        DecodedFrame::GoAway { stream_id, params } => {
            if inner.protocol == Protocol::V2 && stream_id != Some(inner.peer_control_stream_id()) {
                return Err(RpcError::Protocol(format!(
                    "GoAway on stream {:?} instead of the peer control stream",
                    stream_id
                )));
            }
            inner.on_peer_go_away(params);
            Ok(())
        }
        DecodedFrame::Ping => {
            inner.observe_ping();
            if inner.protocol == Protocol::V2 {
                inner.send_nowait(encode_pong(inner.protocol)?);
            }
            Ok(())
        }
        DecodedFrame::Pong => Ok(()),
        DecodedFrame::Reset {
            stream_id,
            error_code,
        } => {
            let slot = {
                let mut state = inner.state();
                let slot = state.streams.remove(&stream_id);
                if slot.is_some() {
                    inner.publish_active(&state);
                }
                slot
            };
            match slot {
                Some(slot) => {
                    let _ = slot.events.send(StreamEvent::Reset { error_code });
                }
                None => tracing::trace!(stream_id, "reset for unknown stream"),
            }
            Ok(())
        }
    }
}

/// Where an inbound data frame belongs.
enum Route {
    Known(mpsc::UnboundedSender<StreamEvent>),
    New(u64, mpsc::UnboundedReceiver<StreamEvent>),
    Discard(&'static str),
}

async fn route_data(
    inner: &Arc<ConnectionInner>,
    stream: StreamRef,
    frame: Frame,
    fin: bool,
) -> Result<()> {
    let request = frame.frame_type == FrameType::Request;
    let route = {
        let mut state = inner.state();
        let (id, peer_initiated) = match stream {
            StreamRef::Id(id) => (id, inner.is_remote(id)),
            StreamRef::RequestId(0) => {
                if !request {
                    return Err(RpcError::Protocol("reply without request id".to_string()));
                }
                let id = state.next_remote_oneway;
                state.next_remote_oneway += 4;
                (id, true)
            }
            StreamRef::RequestId(request_id) => {
                if request && inner.transceiver.is_datagram() {
                    return Err(RpcError::Protocol(
                        "two-way request received over a datagram transport".to_string(),
                    ));
                }
                // Requests come from the peer, replies answer our own requests.
                let peer_is_client = inner.incoming;
                let client_initiated = if request { peer_is_client } else { !peer_is_client };
                (stream_id_from_request_id(request_id, client_initiated), request)
            }
        };

        if let Some(slot) = state.streams.get(&id) {
            Route::Known(slot.events.clone())
        } else if !request || !peer_initiated {
            Route::Discard("frame for an unknown stream")
        } else if is_control(id) {
            return Err(RpcError::Protocol(format!(
                "data frame on control stream {}",
                id
            )));
        } else if state.phase != Phase::Active {
            Route::Discard("new stream while shutting down")
        } else {
            let bidirectional = is_bidirectional(id);
            let last = if bidirectional {
                &mut state.last_remote_bidirectional
            } else {
                &mut state.last_remote_unidirectional
            };
            if inner.protocol == Protocol::V2 && last.is_some_and(|last| id <= last) {
                Route::Discard("frame for a finished stream")
            } else {
                if last.map_or(true, |last| id > last) {
                    *last = Some(id);
                }
                let (tx, rx) = mpsc::unbounded_channel();
                state.streams.insert(id, StreamSlot { events: tx });
                inner.publish_active(&state);
                Route::New(id, rx)
            }
        }
    };

    match route {
        Route::Known(events) => {
            let _ = events.send(StreamEvent::Data { frame, fin });
        }
        Route::Discard(why) => {
            tracing::trace!(?stream, frame_type = frame.frame_type.as_str(), why, "discarding frame");
        }
        Route::New(id, events) => {
            let compress = frame.wants_compressed_response();
            if let Some(slot) = inner.state().streams.get(&id) {
                let _ = slot.events.send(StreamEvent::Data { frame, fin });
            }
            // Waiting for a dispatch slot stops reading from the transport.
            let permit = tokio::select! {
                _ = inner.shutdown.cancelled() => return Ok(()),
                permit = inner.dispatch.acquire(is_bidirectional(id)) => permit?,
            };
            let stream = Stream::incoming(
                Arc::downgrade(inner),
                inner.protocol,
                id,
                events,
                compress,
                permit,
            );
            tracing::trace!(stream_id = id, "accepted stream");
            if inner.accept_tx.send(stream).is_err() {
                tracing::debug!(stream_id = id, "no acceptor for incoming stream");
            }
        }
    }
    Ok(())
}
