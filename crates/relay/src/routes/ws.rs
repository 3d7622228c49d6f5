//! WebSocket handshake endpoint and per-connection pump.
//!
//! `GET /ws?token=<jwt>` authenticates before upgrading: a missing or bad
//! credential gets a 401 and no socket. Once upgraded, the connection is
//! activated and then shuttles push events out until the client leaves, the
//! consumer evicts it, the keepalive lapses, or the relay shuts down.

use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::handshake::Connection;
use crate::state::RelayState;
use crate::store::UserStore;

/// Shortest keepalive interval accepted.
const MIN_PING_INTERVAL: Duration = Duration::from_secs(1);

pub fn router<S: UserStore>() -> Router<RelayState<S>> {
    Router::new().route("/ws", get(ws_upgrade::<S>))
}

/// Query parameters for the handshake.
#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
}

/// GET /ws: authenticate, then upgrade.
///
/// The credential comes from `?token=`, falling back to the
/// `Authorization` header for clients that cannot set query parameters.
async fn ws_upgrade<S: UserStore>(
    State(state): State<RelayState<S>>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    });

    let mut connection = state.handshake.begin();
    if let Err(e) = connection.authenticate(token.as_deref()).await {
        return e.into_response();
    }

    ws.on_upgrade(move |socket| run_connection(socket, connection, state))
}

/// Why a connection's pump stopped.
#[derive(Debug)]
enum CloseReason {
    ClientClosed,
    StreamEnded,
    TransportError,
    KeepaliveExpired,
    Evicted,
    Shutdown,
}

async fn run_connection<S: UserStore>(
    socket: WebSocket,
    mut connection: Connection<S>,
    state: RelayState<S>,
) {
    let (handle, mut outbound) = match connection.activate().await {
        Ok(active) => active,
        Err(e) => {
            tracing::error!(error = %e, "Failed to activate connection");
            connection.close().await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let mut shutdown = state.shutdown.clone();
    let ping_interval = state.ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;
    let mut last_seen = Instant::now();
    let stopping = *shutdown.borrow_and_update();

    let reason = if stopping {
        CloseReason::Shutdown
    } else {
        loop {
            tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else {
                        break CloseReason::Evicted;
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode push event");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::debug!(error = %e, "WebSocket send failed");
                        break CloseReason::TransportError;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive failed");
                        break CloseReason::TransportError;
                    }
                    None => break CloseReason::StreamEnded,
                },
                _ = ping.tick() => {
                    if last_seen.elapsed() > ping_interval * 2 {
                        break CloseReason::KeepaliveExpired;
                    }
                    if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                        tracing::debug!(error = %e, "WebSocket ping failed");
                        break CloseReason::TransportError;
                    }
                }
                _ = handle.evicted() => break CloseReason::Evicted,
                _ = shutdown.changed() => break CloseReason::Shutdown,
            }
        }
    };

    let close_frame = match &reason {
        CloseReason::Evicted => Some((close_code::ERROR, "Delivery failed")),
        CloseReason::KeepaliveExpired => Some((close_code::POLICY, "Keepalive timeout")),
        CloseReason::Shutdown => Some((close_code::AWAY, "Server shutting down")),
        _ => None,
    };
    if let Some((code, text)) = close_frame {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: Utf8Bytes::from_static(text),
            })))
            .await;
    }

    tracing::debug!(
        user_id = %handle.user_id(),
        connection_id = %handle.connection_id(),
        reason = ?reason,
        "Connection pump stopped"
    );

    drop(handle);
    connection.close().await;
}
