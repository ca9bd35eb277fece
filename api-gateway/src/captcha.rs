//! Captcha verification port

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use common::error::{Error, Result};
use serde::Deserialize;
use tracing::{debug, warn};

/// Captcha generation presented by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaVersion {
    V3,
    V4,
}

impl CaptchaVersion {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.unwrap_or("v3") {
            "v3" | "3" => Ok(CaptchaVersion::V3),
            "v4" | "4" => Ok(CaptchaVersion::V4),
            other => Err(Error::InvalidInput(format!("Unsupported captcha version: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptchaVersion::V3 => "v3",
            CaptchaVersion::V4 => "v4",
        }
    }
}

/// Checks a captcha response with the provider
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// `Ok(false)` means the provider rejected the token
    async fn verify(&self, version: CaptchaVersion, token: &str, ip: &str) -> Result<bool>;
}

/// Accepts a fixed set of tokens
#[derive(Default)]
pub struct MemoryCaptchaVerifier {
    accepted: Mutex<HashSet<String>>,
}

impl MemoryCaptchaVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, token: &str) {
        if let Ok(mut accepted) = self.accepted.lock() {
            accepted.insert(token.to_string());
        }
    }
}

#[async_trait]
impl CaptchaVerifier for MemoryCaptchaVerifier {
    async fn verify(&self, _version: CaptchaVersion, token: &str, _ip: &str) -> Result<bool> {
        let accepted = self
            .accepted
            .lock()
            .map_err(|_| Error::Internal("captcha tokens poisoned".to_string()))?;
        Ok(accepted.contains(token))
    }
}

#[derive(Deserialize)]
struct VerifyResponse {
    success: bool,
}

/// Provider reached over HTTP
pub struct HttpCaptchaVerifier {
    client: reqwest::Client,
    url: String,
    secret: String,
}

impl HttpCaptchaVerifier {
    pub fn new(url: &str, secret: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            secret: secret.to_string(),
        }
    }
}

#[async_trait]
impl CaptchaVerifier for HttpCaptchaVerifier {
    async fn verify(&self, version: CaptchaVersion, token: &str, ip: &str) -> Result<bool> {
        let form = [
            ("secret", self.secret.as_str()),
            ("response", token),
            ("remoteip", ip),
            ("version", version.as_str()),
        ];
        let response = self
            .client
            .post(&self.url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("captcha request failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "captcha provider error");
            return Err(Error::Upstream(format!(
                "captcha provider answered {}",
                response.status()
            )));
        }

        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("captcha response unreadable: {}", e)))?;
        debug!(success = parsed.success, version = version.as_str(), "captcha checked");
        Ok(parsed.success)
    }
}
