//! Websocket front end for the relay
//!
//! `GET /ws?fingerprint=..&token=..` upgrades to the JSON signaling protocol.
//! `GET /health` reports live sessions and connections.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use roomdrop_core::{ClientFrame, ServerFrame};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connections::ConnectionInfo;
use crate::relay::Relay;

#[derive(Clone)]
struct RelayState {
    relay: Arc<Relay>,
}

pub struct RelayServer {
    relay: Arc<Relay>,
    addr: String,
}

impl RelayServer {
    pub fn new(relay: Relay, addr: String) -> Self {
        Self {
            relay: Arc::new(relay),
            addr,
        }
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_check))
            .with_state(RelayState {
                relay: self.relay.clone(),
            })
    }

    /// Bind the configured address and serve until the process stops
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    fingerprint: Option<String>,
    token: Option<String>,
}

async fn health_check(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.relay.session_count().await,
        "connections": state.relay.connection_count().await,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    // Without a device fingerprint, quotas fall back to the client address
    let info = ConnectionInfo {
        fingerprint: params
            .fingerprint
            .unwrap_or_else(|| remote.ip().to_string()),
        token: params.token,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, info))
}

/// Handle a single websocket connection
async fn handle_socket(socket: WebSocket, state: RelayState, info: ConnectionInfo) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn, mut rx) = state.relay.connect(info).await;

    // Forward queued frames (acks and events) to the socket in order
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Invalid frame from {}: {}", conn, e);
                        continue;
                    }
                };
                let result = state.relay.handle_request(conn, frame.request).await;
                if let Some(ack) = frame.id {
                    state
                        .relay
                        .send_to(conn, ServerFrame::Ack { ack, result })
                        .await;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ping/Pong handled by axum, binary is not part of the protocol
            Err(e) => {
                error!("WebSocket error on {}: {}", conn, e);
                break;
            }
        }
    }

    debug!("{} closed", conn);
    // Unregistering drops the queue sender, which ends the send task
    state.relay.disconnect(conn).await;
    let _ = send_task.await;
}
