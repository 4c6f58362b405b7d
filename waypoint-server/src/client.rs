//! The WebSocket client channel.
//!
//! Every accepted connection gets one task that multiplexes inbound
//! frames and outbound deliveries over the same socket. Inbound text
//! that is not a well-formed `{task, load}` document is dropped with no
//! reply; engine operations run synchronously between polls.

use crate::gateway::Gateway;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use waypoint_core::registry::ConnectionId;
use waypoint_core::time;
use waypoint_protocol::Payload;

/// Handles one client connection from accept to close.
pub async fn handle_connection(gateway: Arc<Gateway>, stream: TcpStream, addr: SocketAddr) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::debug!(%addr, %err, "websocket handshake failed");
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = gateway.engine().on_connection_open(addr.to_string(), tx);
    tracing::debug!(conn, %addr, "open connection");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(text) => {
                        if ws.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&gateway, conn, &text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(conn, %err, "client read error");
                        break;
                    }
                }
            }
        }
    }

    gateway.engine().on_connection_closed(conn);
    tracing::debug!(conn, %addr, "close connection");
}

/// Routes one client message into the engine.
pub fn dispatch(gateway: &Gateway, conn: ConnectionId, text: &str) {
    // a message without both `task` and `load` is silently dropped
    let Some(payload) = Payload::from_client_text(text) else {
        return;
    };

    match payload.task.as_str() {
        "healthCheck" => health_check(gateway, conn, &payload.load),
        "subscribe" => {
            gateway.engine().subscribe(conn, &payload.load, time::unix_now());
        }
        "unsubscribe" => {
            gateway.engine().unsubscribe_client(conn, &payload.load);
        }
        unknown => {
            tracing::debug!(conn, task = unknown, "unknown task");
        }
    }
}

/// Answers a client liveness probe.
///
/// The reply carries a fresh token and subscription statistics only when
/// the probe token matched the one pushed by the backend.
fn health_check(gateway: &Gateway, conn: ConnectionId, load: &Value) {
    let token = load.as_f64().unwrap_or(0.0);
    let new_token = time::unix_now_micros();

    let mut engine = gateway.engine();
    let reply_load = match engine.client_health_check(token, new_token) {
        Some(stats) => json!({
            "isValid": true,
            "token": new_token,
            "subStats": stats,
        }),
        None => json!({"isValid": false}),
    };
    if let Ok(reply) = Payload::new("healthCheck", reply_load, None) {
        engine.send_to(conn, &reply);
    }
}
