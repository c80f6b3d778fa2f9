//! HTTP and WebSocket surface.
//!
//! Plain HTTP carries the service/status endpoints and the Wake-on-LAN
//! trigger; everything else happens over the `/ws` upgrade. Each socket
//! gets an outbound queue and a select loop bridging it to the relay
//! core, so handlers never block on socket writes.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::protocol::encode_server_message;
use crate::registry::{ConnectionHandle, Outbound};
use crate::relay::Relay;
use crate::wol;

/// Maximum inbound WebSocket payload (10 MiB).
pub const MAX_WS_PAYLOAD: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(service_info))
        .route("/status", get(status))
        .route("/wol", post(wake_on_lan))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
    features: Vec<&'static str>,
}

async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: "tether-relay",
        version: env!("CARGO_PKG_VERSION"),
        features: vec![
            "relay",
            "sessions",
            "trusted-devices",
            "file-transfer",
            "file-watcher",
            "wake-on-lan",
        ],
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionCounts {
    total: usize,
    active: usize,
    expired: usize,
    unique_users: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    computers: usize,
    clients: usize,
    sessions: SessionCounts,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (computers, clients) = state.relay.registry.counts();
    let stats = state.relay.sessions.stats();
    Json(StatusResponse {
        status: "online",
        version: env!("CARGO_PKG_VERSION"),
        computers,
        clients,
        sessions: SessionCounts {
            total: stats.total,
            active: stats.active,
            expired: stats.expired,
            unique_users: stats.unique_users,
        },
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WolRequest {
    mac: String,
    broadcast_ip: Option<String>,
    port: Option<u16>,
}

async fn wake_on_lan(
    Json(req): Json<WolRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match wol::send_magic_packet(&req.mac, req.broadcast_ip.as_deref(), req.port).await {
        Ok(target) => Ok(Json(serde_json::json!({
            "success": true,
            "mac": req.mac,
            "target": target,
        }))),
        Err(e @ wol::WolError::InvalidMac(_)) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": "Failed to send magic packet",
                "details": e.to_string(),
            })),
        )),
    }
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_WS_PAYLOAD)
        .on_upgrade(|socket| handle_socket(socket, state))
}

/// Bridge one WebSocket to the relay core until either side gives up.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let relay = state.relay;
    let (handle, mut out_rx) = ConnectionHandle::new();
    let cancel = handle.cancel.clone();
    let conn = relay.register_connection(handle);
    tracing::debug!(conn, "websocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Reaper fired: drop the socket without ceremony.
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            // Relay core -> socket.
            out = out_rx.recv() => {
                match out {
                    Some(Outbound::Frame(msg)) => {
                        let text = encode_server_message(&msg);
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }

            // Socket -> relay core.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => relay.handle_frame(conn, &text),
                    Some(Ok(Message::Pong(_))) => relay.pong_received(conn),
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(conn, "ignoring binary frame");
                    }
                    // Inbound pings are answered by the library.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(conn, error = %e, "websocket error");
                        break;
                    }
                }
            }
        }
    }

    relay.disconnect(conn);
    tracing::debug!(conn, "websocket closed");
}
