//! Error types for the exchange core
//!
//! Every fallible operation in the workspace returns [`Result`]. Errors carry a
//! [`ErrorKind`] so the HTTP boundary can map them to a status code without
//! knowing which service produced them.

use std::fmt::Display;
use thiserror::Error;

/// Coarse error classification used at service boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    AccessDenied,
    NotFound,
    Conflict,
    PreconditionRequired,
    RateLimited,
    Upstream,
    Internal,
}

/// Exchange core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or semantically invalid client input
    #[error("{0}")]
    InvalidInput(String),

    /// Missing or unusable credentials
    #[error("{0}")]
    Unauthorized(String),

    /// Authenticated principal is not allowed to perform the operation
    #[error("{0}")]
    AccessDenied(String),

    /// Referenced resource does not exist (or is not visible to the caller)
    #[error("{0}")]
    NotFound(String),

    /// Operation conflicts with the current state of the resource
    #[error("{0}")]
    Conflict(String),

    /// A further verification step (2FA, IP confirmation) is owed
    #[error("{0}")]
    PreconditionRequired(String),

    /// Caller exceeded a rate limit
    #[error("{0}")]
    RateLimited(String),

    /// An external collaborator (custody, SMS, captcha, KYC) failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::AccessDenied(_) => ErrorKind::AccessDenied,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::PreconditionRequired(_) => ErrorKind::PreconditionRequired,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Upstream(_) => ErrorKind::Upstream,
            Error::Internal(_) | Error::Database(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// The token failed signature, algorithm or expiry checks
    pub fn invalid_token() -> Self {
        Error::Unauthorized("Invalid token".to_string())
    }

    /// A client-supplied account group did not resolve to a sub-account
    pub fn invalid_account() -> Self {
        Error::InvalidInput("Invalid account".to_string())
    }

    /// Whether the error text is safe to show to clients
    pub fn is_client_visible(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Upstream | ErrorKind::Internal)
    }
}

/// Extension trait to add context to error results
pub trait ErrorExt<T> {
    /// Add context information to an error
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T> ErrorExt<T> for Result<T> {
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|e| {
            let context = context_fn().to_string();
            match e {
                // Client-facing messages are kept verbatim
                Error::InvalidInput(_)
                | Error::Unauthorized(_)
                | Error::AccessDenied(_)
                | Error::NotFound(_)
                | Error::Conflict(_)
                | Error::PreconditionRequired(_)
                | Error::RateLimited(_) => e,
                Error::Upstream(msg) => Error::Upstream(format!("{}: {}", context, msg)),
                Error::Internal(msg) => Error::Internal(format!("{}: {}", context, msg)),
                Error::Database(e) => Error::Internal(format!("{}: {}", context, e)),
                Error::Serialization(e) => Error::Internal(format!("{}: {}", context, e)),
            }
        })
    }
}

/// Trait for converting other error types to our Error type
pub trait IntoError {
    /// Convert to an internal error
    fn into_error(self, message: &str) -> Error;

    /// Convert to an upstream error
    fn into_upstream(self, message: &str) -> Error;
}

impl<E: std::error::Error> IntoError for E {
    fn into_error(self, message: &str) -> Error {
        Error::Internal(format!("{}: {}", message, self))
    }

    fn into_upstream(self, message: &str) -> Error {
        Error::Upstream(format!("{}: {}", message, self))
    }
}

/// Convert string messages into an error
impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Internal(message)
    }
}

/// Convert static string references into an error
impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Internal(message.to_string())
    }
}

/// From rust_decimal::Error
impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::InvalidInput(format!("Invalid decimal: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_client_messages() {
        let result: Result<()> = Err(Error::NotFound("Order not found".to_string()));
        let err = result.with_context(|| "loading order").unwrap_err();
        assert_eq!(err.to_string(), "Order not found");
    }

    #[test]
    fn context_prefixes_internal_messages() {
        let result: Result<()> = Err(Error::Internal("boom".to_string()));
        let err = result.with_context(|| "loading order").unwrap_err();
        assert_eq!(err.to_string(), "Internal error: loading order: boom");
        assert!(!err.is_client_visible());
    }
}
