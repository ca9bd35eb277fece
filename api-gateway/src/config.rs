//! Gateway configuration

use std::env;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listening address
    pub addr: String,
    /// Admit roles that are not UI-facing
    pub allow_non_ui_roles: bool,
    /// Roles treated as UI-facing in addition to the role table
    pub ui_roles: Vec<String>,
    /// Captcha provider verification endpoint; an in-memory verifier is used when unset
    pub captcha_url: Option<String>,
    pub captcha_secret: String,
    /// Allowed CORS origins; any origin when empty
    pub cors_origins: Vec<String>,
    /// Shared secret custody presents on status callbacks; callbacks are refused when unset
    pub custody_callback_secret: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: env::var("API_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            allow_non_ui_roles: env::var("ALLOW_NON_UI_ROLES")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            ui_roles: env_list("UI_ROLES", &["member", "admin"]),
            captcha_url: env::var("CAPTCHA_URL").ok(),
            captcha_secret: env::var("CAPTCHA_SECRET").unwrap_or_default(),
            cors_origins: env_list("CORS_ORIGINS", &[]),
            custody_callback_secret: env::var("CUSTODY_CALLBACK_SECRET").ok(),
        }
    }
}

impl GatewayConfig {
    /// Create a new configuration using environment variables
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn is_ui_role(&self, role: &str) -> bool {
        self.ui_roles.iter().any(|r| r == role)
    }
}

fn env_list(name: &str, default: &[&str]) -> Vec<String> {
    match env::var(name) {
        Ok(value) => value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}
