use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    http::{header::USER_AGENT, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use forge_core::config::MAX_PAYLOAD_BYTES;
use forge_core::{Channel, ConnectionId};
use forge_protocol::{events, Envelope};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::app::AppState;

/// Upgrades GET /ws/{channel} to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let channel: Channel = match channel.parse() {
        Ok(channel) => channel,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "code": e.code(), "message": e.to_string() })),
            )
                .into_response();
        }
    };
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.on_upgrade(move |socket| run_connection(socket, state, channel, addr, user_agent))
}

/// Per-connection event loop, alive for the whole session.
async fn run_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    channel: Channel,
    addr: SocketAddr,
    user_agent: String,
) {
    let conn_id = ConnectionId::new();
    let gateway = Arc::clone(&state.gateway);
    let (mut tx, mut rx) = socket.split();

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(state.config.gateway.outbox_capacity);
    if let Err(e) = gateway.admit(
        conn_id.clone(),
        channel,
        addr.to_string(),
        user_agent,
        outbox_tx,
    ) {
        warn!(conn_id = %conn_id, channel = %channel, error = %e, "connection refused");
        let refusal = Envelope::error(
            events::ERROR,
            json!({ "code": e.code(), "message": e.to_string() }),
        );
        let _ = tx.send(Message::Text(refusal.to_json().into())).await;
        let _ = tx.send(Message::Close(None)).await;
        return;
    }
    info!(conn_id = %conn_id, channel = %channel, remote = %addr, "new WS connection");

    let heartbeat = Duration::from_secs(state.config.gateway.heartbeat_secs.max(1));
    let mut tick = interval_at(Instant::now() + heartbeat, heartbeat);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id = %conn_id, size = text.len(), "payload too large");
                            break "payload-too-large";
                        }
                        if gateway.handle_client_message(&conn_id, text.as_str()).is_err() {
                            // Already released elsewhere, e.g. after a send failure.
                            break "released";
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if tx.send(Message::Pong(data)).await.is_err() {
                            break "send-failure";
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "client-close",
                    Some(Err(e)) => {
                        gateway.registry().record_error(Some(&conn_id), e.to_string());
                        break "transport-error";
                    }
                    _ => {}
                }
            }

            out = outbox_rx.recv() => {
                match out {
                    Some(payload) => {
                        if tx.send(Message::Text(payload.into())).await.is_err() {
                            break "send-failure";
                        }
                    }
                    // The gateway dropped our outbox, so the record is already closed.
                    None => break "released",
                }
            }

            _ = tick.tick() => {
                let beat = Envelope::success(
                    events::HEARTBEAT,
                    json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                );
                if gateway.send_to(&conn_id, &beat).is_err() {
                    break "send-failure";
                }
            }
        }
    };

    gateway.release(&conn_id, reason);
    let _ = tx.send(Message::Close(None)).await;
    info!(conn_id = %conn_id, reason, "WS connection closed");
}
