//! Domain models for the exchange core

pub mod user;
pub mod sub_account;
pub mod api_key;
pub mod action;
pub mod order;
pub mod market;
pub mod withdraw;
pub mod balance;
pub mod principal;
pub mod notification;

/// User identifier
pub type UserId = i64;

/// Sub-account identifier
pub type SubAccountId = i64;

/// Order identifier assigned by the matching engine
pub type OrderId = i64;

/// API key identifier
pub type ApiKeyId = i64;

pub use principal::{ApiKeyGrant, KeyAccess, Principal};
