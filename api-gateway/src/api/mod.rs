//! API handlers
//!
//! Every handler follows the same pattern:
//! - extract state, principal and parameters with axum extractors
//! - run the permission and capability gates the endpoint needs
//! - call the owning service
//! - wrap the result in a response envelope

pub mod account;
pub mod actions;
pub mod api_keys;
pub mod auth;
pub mod market;
pub mod notifications;
pub mod order;
pub mod profile;
pub mod response;
pub mod wallet;

use common::error::Error;
use common::model::Principal;

use crate::error::ApiError;

pub use response::{ApiListResponse, ApiResponse, ListMeta, Paging};

/// Reject API-key principals on account-security endpoints
pub(crate) fn session_only(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_api_key() {
        return Err(Error::AccessDenied("API keys cannot use this endpoint".to_string()).into());
    }
    Ok(())
}
