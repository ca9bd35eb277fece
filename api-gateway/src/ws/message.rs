//! WebSocket messages

use serde::{Deserialize, Serialize};

/// WebSocket request message
#[derive(Debug, Deserialize)]
pub struct WsRequest {
    /// Request ID, echoed in the response
    pub id: String,
    /// `subscribe`, `unsubscribe` or `ping`
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// WebSocket response message
#[derive(Debug, Serialize)]
pub struct WsResponse {
    /// Request ID
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl WsResponse {
    pub fn ok(id: String, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: String, code: u16, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(WsError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// WebSocket error; `code` follows the HTTP status of the same failure
#[derive(Debug, Serialize)]
pub struct WsError {
    pub code: u16,
    pub message: String,
}

/// Server-initiated message
#[derive(Debug, Serialize)]
pub struct WsNotification {
    pub method: String,
    pub params: serde_json::Value,
}

/// `subscribe` / `unsubscribe` parameters
#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub channel: String,
    /// Bearer token for user channels; the upgrade request's token otherwise
    #[serde(default)]
    pub token: Option<String>,
}
