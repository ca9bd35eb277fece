//! Configuration for the auth service

use std::env;

/// Configuration for the auth service
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC secret for session tokens
    pub session_secret: String,
    /// HMAC secret for pre-auth stage tokens
    pub preauth_secret: String,
    /// Lifetime of a regular session
    pub session_ttl_minutes: i64,
    /// Lifetime of a "remember me" session
    pub remember_ttl_days: i64,
    /// Lifetime of 2FA and IP-confirmation pre-auth tokens
    pub preauth_ttl_minutes: i64,
    /// Lifetime of the email-confirmation pre-auth token
    pub email_preauth_ttl_minutes: i64,
    /// Minimum interval between two SMS challenges for a user
    pub sms_challenge_interval_secs: i64,
    /// Accepted TOTP windows on each side of the current one
    pub totp_skew: u64,
    /// Base URL used in email links
    pub public_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_secret: env::var("SESSION_SECRET")
                .unwrap_or_else(|_| "dev-session-secret-change-me".to_string()),
            preauth_secret: env::var("PREAUTH_SECRET")
                .unwrap_or_else(|_| "dev-preauth-secret-change-me".to_string()),
            session_ttl_minutes: env_number("SESSION_TTL_MINUTES", 240),
            remember_ttl_days: env_number("REMEMBER_TTL_DAYS", 30),
            preauth_ttl_minutes: env_number("PREAUTH_TTL_MINUTES", 15),
            email_preauth_ttl_minutes: env_number("EMAIL_PREAUTH_TTL_MINUTES", 30),
            sms_challenge_interval_secs: env_number("SMS_CHALLENGE_INTERVAL_SECS", 60),
            totp_skew: env_number("TOTP_SKEW", 2),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
        }
    }
}

impl AuthConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Configuration with fixed secrets, for tests
    pub fn with_secrets(session_secret: &str, preauth_secret: &str) -> Self {
        Self {
            session_secret: session_secret.to_string(),
            preauth_secret: preauth_secret.to_string(),
            ..Self::default()
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
