use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::http::{ApiError, AppState};
use crate::limits::MAX_INBOUND_FRAME_LEN;
use crate::model::{Booking, SlotHolds};
use crate::observability;

/// Frames the server sends besides broadcast events.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { session_id: Ulid },
    /// Current holds plus every pending or confirmed booking.
    Snapshot {
        holds: Vec<SlotHolds>,
        bookings: Vec<Booking>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Snapshot,
}

/// `GET /ws`: upgrade and run a session, if a session slot is free.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let permit = match state.sessions.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("session limit reached, rejecting websocket");
            metrics::counter!(observability::SESSIONS_REJECTED_TOTAL).increment(1);
            return ApiError::TooManySessions.into_response();
        }
    };

    let engine = state.engine.clone();
    let shutdown = state.shutdown.child_token();
    ws.max_message_size(MAX_INBOUND_FRAME_LEN)
        .on_upgrade(move |socket| async move {
            let _permit = permit; // held until the session's leases are gone
            let (sink, stream) = socket.split();
            run_session(sink, stream, engine, Ulid::new(), shutdown).await;
        })
}

async fn snapshot_frame(engine: &Engine) -> ServerFrame {
    let holds = engine.lock_snapshot();
    let bookings = match engine.active_bookings().await {
        Ok(bookings) => bookings,
        Err(e) => {
            warn!("snapshot sent without bookings: {e}");
            Vec::new()
        }
    };
    ServerFrame::Snapshot { holds, bookings }
}

async fn send_frame<S, T>(sink: &mut S, frame: &T) -> bool
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!("failed to encode frame: {e}");
            return true;
        }
    };
    sink.send(Message::Text(json.into())).await.is_ok()
}

/// Drive one real-time session until the peer goes away.
///
/// The first frame is a welcome carrying the server-assigned session id.
/// After that every broadcast event is forwarded, and a `{"type":"snapshot"}`
/// request is answered with the current holds and active bookings. A
/// subscriber that falls behind the broadcast buffer gets a snapshot in place
/// of what it missed. Cancelling `shutdown` sends a close frame and ends the
/// session. Every lease the session still holds is released before this
/// returns.
pub async fn run_session<Tx, Rx, E>(
    mut sink: Tx,
    mut stream: Rx,
    engine: Arc<Engine>,
    session_id: Ulid,
    shutdown: CancellationToken,
) where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    metrics::counter!(observability::SESSIONS_TOTAL).increment(1);
    metrics::gauge!(observability::SESSIONS_ACTIVE).increment(1.0);
    info!(%session_id, "session connected");

    let mut events = engine.notify.subscribe();
    if send_frame(&mut sink, &ServerFrame::Welcome { session_id }).await {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(%session_id, "server shutting down, closing session");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str().len() > MAX_INBOUND_FRAME_LEN {
                            debug!(%session_id, len = text.as_str().len(), "oversized frame dropped");
                            continue;
                        }
                        match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(ClientFrame::Snapshot) => {
                                if !send_frame(&mut sink, &snapshot_frame(&engine).await).await {
                                    break;
                                }
                            }
                            Err(e) => debug!(%session_id, "ignoring client frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%session_id, "socket error: {e}");
                        break;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if !send_frame(&mut sink, &event).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(%session_id, missed, "subscriber lagged, resending snapshot");
                        metrics::counter!(observability::SUBSCRIBER_LAGS_TOTAL).increment(1);
                        if !send_frame(&mut sink, &snapshot_frame(&engine).await).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    let released = engine.release_all_for(session_id).await;
    metrics::gauge!(observability::SESSIONS_ACTIVE).decrement(1.0);
    info!(%session_id, released, "session disconnected");
}
