//! Error handling for the API gateway
//!
//! Every failure leaves the gateway as `{ "error": "<message>" }` with the
//! status derived from the error kind. Upstream and internal failures are
//! logged under a correlation id and the client only sees a generic message
//! carrying that id.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Present on server-side failures, matches the logged correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request the extractors rejected
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Service(#[from] Error),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BadRequest(_) => ErrorKind::InvalidInput,
            ApiError::Service(e) => e.kind(),
        }
    }

    pub fn status(&self) -> StatusCode {
        status_for(self.kind())
    }
}

/// HTTP status of an error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        // Replace conflicts are reported as bad requests
        ErrorKind::InvalidInput | ErrorKind::Conflict => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::PreconditionRequired => StatusCode::LOCKED,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::Service(e) if !e.is_client_visible() => {
                let correlation_id = Uuid::new_v4().to_string();
                tracing::error!(correlation_id = %correlation_id, kind = ?e.kind(), "request failed: {}", e);
                let message = match e.kind() {
                    ErrorKind::Upstream => "Service temporarily unavailable",
                    _ => "Internal server error",
                };
                ErrorResponse {
                    error: message.to_string(),
                    correlation_id: Some(correlation_id),
                }
            }
            _ => {
                tracing::debug!(%status, "request rejected: {}", self);
                ErrorResponse {
                    error: self.to_string(),
                    correlation_id: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        let cases = [
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::Conflict("x".into()), StatusCode::BAD_REQUEST),
            (Error::invalid_token(), StatusCode::UNAUTHORIZED),
            (Error::AccessDenied("x".into()), StatusCode::FORBIDDEN),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::PreconditionRequired("x".into()), StatusCode::LOCKED),
            (Error::RateLimited("x".into()), StatusCode::TOO_MANY_REQUESTS),
            (Error::Upstream("x".into()), StatusCode::BAD_GATEWAY),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[tokio::test]
    async fn upstream_text_never_reaches_the_client() {
        let response =
            ApiError::from(Error::Upstream("custody at 10.0.0.5 refused".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "Service temporarily unavailable");
        assert!(body.correlation_id.is_some());
    }

    #[tokio::test]
    async fn client_errors_keep_their_message() {
        let response = ApiError::from(Error::invalid_account()).into_response();
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.error, "Invalid account");
        assert!(body.correlation_id.is_none());
    }
}
