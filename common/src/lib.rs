//! Common types and utilities for the exchange core
//!
//! This library contains the shared error kinds, domain models and
//! process-wide plumbing (feature flags, coalescing caches, worker pools,
//! outbound mail) used by every service crate.

pub mod error;
pub mod model;
pub mod decimal;
pub mod features;
pub mod cache;
pub mod pool;
pub mod locks;
pub mod mail;
pub mod db;

/// Re-export important types
pub use error::{Error, ErrorKind, Result, ErrorExt, IntoError};
pub use decimal::*;
pub use features::{FeatureFlags, FlagContext, StaticFeatureFlags};

// Re-export utoipa for use in model ToSchema derives
#[cfg(feature = "utoipa")]
pub use utoipa;
