//! WebSocket handler implementation
//!
//! One connection is one hub subscriber. A single send task owns the socket
//! sink and forwards both request responses and hub pushes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use common::error::Error;
use futures::{SinkExt, StreamExt};
use realtime::{Channel, SubscriberId};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::status_for;
use crate::extract::{bearer, ClientIp};
use crate::state::AppState;
use crate::ws::message::{ChannelParams, WsNotification, WsRequest, WsResponse};

const OUTBOUND_QUEUE: usize = 100;

/// Handle WebSocket upgrade
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = bearer(&headers).map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, ip))
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Error encoding websocket message: {}", e);
            None
        }
    }
}

fn error_response(id: String, e: &Error) -> WsResponse {
    let message = if e.is_client_visible() {
        e.to_string()
    } else {
        error!(kind = ?e.kind(), "websocket request failed: {}", e);
        "Internal server error".to_string()
    };
    WsResponse::err(id, status_for(e.kind()).as_u16(), message)
}

struct Connection {
    state: Arc<AppState>,
    id: SubscriberId,
    /// Bearer token of the upgrade request
    token: Option<String>,
    ip: String,
}

impl Connection {
    async fn handle(&self, request: WsRequest) -> WsResponse {
        let id = request.id.clone();
        match self.dispatch(request).await {
            Ok(result) => WsResponse::ok(id, result),
            Err(e) => error_response(id, &e),
        }
    }

    async fn dispatch(&self, request: WsRequest) -> common::Result<serde_json::Value> {
        match request.method.as_str() {
            "subscribe" => {
                let params = channel_params(request.params)?;
                let token = params.token.as_deref().or(self.token.as_deref());
                let channel = self
                    .state
                    .realtime
                    .hub
                    .subscribe(self.id, &params.channel, token, &self.ip)
                    .await?;
                Ok(json!({ "subscribed": channel.to_string() }))
            }
            "unsubscribe" => {
                let params = channel_params(request.params)?;
                let channel: Channel = params.channel.parse()?;
                let removed = self.state.realtime.hub.unsubscribe(self.id, &channel);
                Ok(json!({ "unsubscribed": removed }))
            }
            "ping" => Ok(json!({ "pong": chrono::Utc::now().to_rfc3339() })),
            other => Err(Error::InvalidInput(format!("Unknown method: {}", other))),
        }
    }
}

fn channel_params(params: serde_json::Value) -> common::Result<ChannelParams> {
    serde_json::from_value(params)
        .map_err(|e| Error::InvalidInput(format!("Invalid params: {}", e)))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>, ip: String) {
    let (id, mut pushes) = state.realtime.hub.connect();
    info!(subscriber = %id, "New WebSocket connection");

    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                Some(text) = rx.recv() => text,
                Some(push) = pushes.recv() => {
                    let notification = WsNotification {
                        method: "update".to_string(),
                        params: json!({ "channel": push.channel, "data": push.data }),
                    };
                    match encode(&notification) {
                        Some(text) => text,
                        None => continue,
                    }
                }
                else => break,
            };
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                debug!("Error sending message: {}", e);
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let connection = Connection {
        state: state.clone(),
        id,
        token,
        ip,
    };

    while let Some(result) = ws_receiver.next().await {
        let response = match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsRequest>(&text) {
                Ok(request) => connection.handle(request).await,
                Err(e) => WsResponse::err("0".to_string(), 400, format!("Invalid request: {}", e)),
            },
            Ok(Message::Close(_)) => {
                debug!("Received close message");
                break;
            }
            Err(e) => {
                warn!(subscriber = %id, "Error receiving message: {}", e);
                break;
            }
            // Pings are answered by axum
            Ok(_) => continue,
        };
        let Some(text) = encode(&response) else {
            continue;
        };
        if tx.send(text).await.is_err() {
            break;
        }
    }

    state.realtime.hub.disconnect(id);
    send_task.abort();
    info!(subscriber = %id, "WebSocket connection closed");
}
