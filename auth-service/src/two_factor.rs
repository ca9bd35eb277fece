//! Second-factor verification
//!
//! Google-auth style TOTP is checked locally. SMS codes are generated and
//! checked by an external provider behind [`SmsProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::error::{Error, Result};
use common::model::user::{TwoFactorMethod, UserSettings};
use common::model::UserId;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

/// RFC 6238 time-based one-time passwords (SHA-1, 30 s step, 6 digits)
pub mod totp {
    use hmac::{Hmac, Mac};
    use rand::RngCore;
    use sha1::Sha1;

    pub const STEP_SECS: u64 = 30;
    pub const DIGITS: u32 = 6;

    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    /// New random 160-bit secret, base32 encoded without padding
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        encode_base32(&bytes)
    }

    pub fn encode_base32(bytes: &[u8]) -> String {
        let mut out = String::with_capacity((bytes.len() * 8 + 4) / 5);
        let mut buffer: u32 = 0;
        let mut bits = 0;
        for &b in bytes {
            buffer = (buffer << 8) | b as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }

    /// Decode base32; case, spaces and padding are ignored
    pub fn decode_base32(input: &str) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(input.len() * 5 / 8);
        let mut buffer: u32 = 0;
        let mut bits = 0;
        for c in input.chars() {
            if c == '=' || c == ' ' {
                continue;
            }
            let upper = c.to_ascii_uppercase() as u8;
            let value = ALPHABET.iter().position(|&a| a == upper)? as u32;
            buffer = (buffer << 5) | value;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                out.push(((buffer >> bits) & 0xff) as u8);
            }
        }
        Some(out)
    }

    /// HOTP value for a counter
    pub fn hotp(secret: &[u8], counter: u64) -> u32 {
        let mut mac = match Hmac::<Sha1>::new_from_slice(secret) {
            Ok(mac) => mac,
            Err(_) => return u32::MAX,
        };
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let code = ((digest[offset] as u32 & 0x7f) << 24)
            | ((digest[offset + 1] as u32) << 16)
            | ((digest[offset + 2] as u32) << 8)
            | (digest[offset + 3] as u32);
        code % 10u32.pow(DIGITS)
    }

    /// The code for a unix time, zero padded
    pub fn code_at(secret_b32: &str, unix_time: u64) -> Option<String> {
        let secret = decode_base32(secret_b32)?;
        Some(format!(
            "{:0width$}",
            hotp(&secret, unix_time / STEP_SECS),
            width = DIGITS as usize
        ))
    }

    /// Accept the code of the current window or up to `skew` windows around it
    pub fn verify(secret_b32: &str, code: &str, unix_time: u64, skew: u64) -> bool {
        let Some(secret) = decode_base32(secret_b32) else {
            return false;
        };
        if code.len() != DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        let Ok(presented) = code.parse::<u32>() else {
            return false;
        };
        let counter = unix_time / STEP_SECS;
        let first = counter.saturating_sub(skew);
        (first..=counter + skew).any(|c| hotp(&secret, c) == presented)
    }
}

/// External SMS verification provider
#[async_trait]
pub trait SmsProvider: Send + Sync {
    /// Send a fresh code to the destination
    async fn send_challenge(&self, destination: &str) -> Result<()>;

    /// Check a code previously sent to the destination
    async fn check(&self, destination: &str, code: &str) -> Result<bool>;
}

/// Provider that keeps the last code per destination in memory
#[derive(Default)]
pub struct MemorySmsProvider {
    codes: DashMap<String, String>,
}

impl MemorySmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The code last sent to a destination
    pub fn last_code(&self, destination: &str) -> Option<String> {
        self.codes.get(destination).map(|c| c.clone())
    }
}

#[async_trait]
impl SmsProvider for MemorySmsProvider {
    async fn send_challenge(&self, destination: &str) -> Result<()> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        debug!(destination, "sms challenge sent");
        self.codes.insert(destination.to_string(), code);
        Ok(())
    }

    async fn check(&self, destination: &str, code: &str) -> Result<bool> {
        let matched = self
            .codes
            .get(destination)
            .map(|c| c.as_str() == code)
            .unwrap_or(false);
        if matched {
            self.codes.remove(destination);
        }
        Ok(matched)
    }
}

fn invalid_code() -> Error {
    Error::Unauthorized("Invalid verification code".to_string())
}

/// Verifies second factors and rate-limits SMS challenges
pub struct TwoFactorVerifier {
    sms: Arc<dyn SmsProvider>,
    last_challenge: DashMap<UserId, DateTime<Utc>>,
    challenge_interval: Duration,
    skew: u64,
}

impl TwoFactorVerifier {
    pub fn new(sms: Arc<dyn SmsProvider>, challenge_interval_secs: i64, skew: u64) -> Self {
        Self {
            sms,
            last_challenge: DashMap::new(),
            challenge_interval: Duration::seconds(challenge_interval_secs),
            skew,
        }
    }

    /// Check a code for a given method
    pub async fn verify(
        &self,
        settings: &UserSettings,
        method: TwoFactorMethod,
        code: &str,
    ) -> Result<()> {
        match method {
            TwoFactorMethod::GoogleAuth => {
                let secret = settings
                    .google_auth_secret
                    .as_deref()
                    .ok_or_else(|| Error::InvalidInput("Google auth is not configured".to_string()))?;
                self.verify_totp(secret, code)
            }
            TwoFactorMethod::Sms => {
                let destination = settings
                    .sms_auth_destination
                    .as_deref()
                    .ok_or_else(|| Error::InvalidInput("SMS auth is not configured".to_string()))?;
                self.verify_sms(destination, code).await
            }
        }
    }

    /// Check a code against the user's primary method
    pub async fn verify_primary(&self, settings: &UserSettings, code: &str) -> Result<()> {
        let method = settings
            .primary_two_factor
            .ok_or_else(|| Error::InvalidInput("Two-factor authentication is not enabled".to_string()))?;
        self.verify(settings, method, code).await
    }

    /// Check a TOTP code against an explicit secret
    pub fn verify_totp(&self, secret_b32: &str, code: &str) -> Result<()> {
        let now = Utc::now().timestamp().max(0) as u64;
        if totp::verify(secret_b32, code, now, self.skew) {
            Ok(())
        } else {
            Err(invalid_code())
        }
    }

    /// Check an SMS code for an explicit destination
    pub async fn verify_sms(&self, destination: &str, code: &str) -> Result<()> {
        let ok = self
            .sms
            .check(destination, code)
            .await
            .map_err(|e| Error::Upstream(format!("sms provider: {}", e)))?;
        if ok {
            Ok(())
        } else {
            Err(invalid_code())
        }
    }

    /// Send an SMS code, at most once per interval per user
    pub async fn request_sms_challenge(&self, user_id: UserId, destination: &str) -> Result<()> {
        let now = Utc::now();
        // The slot is reserved before sending and released if the send fails
        {
            let mut entry = self
                .last_challenge
                .entry(user_id)
                .or_insert(now - self.challenge_interval);
            if now - *entry < self.challenge_interval {
                return Err(Error::RateLimited(
                    "SMS code was sent recently, try again later".to_string(),
                ));
            }
            *entry = now;
        }

        if let Err(e) = self.sms.send_challenge(destination).await {
            warn!(user_id, "sms challenge failed: {}", e);
            self.last_challenge.remove(&user_id);
            return Err(Error::Upstream(format!("sms provider: {}", e)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 test secret "12345678901234567890"
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn base32_round_trip() {
        let bytes = b"12345678901234567890";
        assert_eq!(totp::encode_base32(bytes), RFC_SECRET);
        assert_eq!(totp::decode_base32(RFC_SECRET).unwrap(), bytes.to_vec());
        assert!(totp::decode_base32("not base32!").is_none());
    }

    #[test]
    fn matches_reference_vectors() {
        assert_eq!(totp::code_at(RFC_SECRET, 59).unwrap(), "287082");
        assert_eq!(totp::code_at(RFC_SECRET, 1111111109).unwrap(), "081804");
    }

    #[test]
    fn accepts_codes_within_skew() {
        let t = 1_000_000_000u64;
        let code = totp::code_at(RFC_SECRET, t).unwrap();
        assert!(totp::verify(RFC_SECRET, &code, t, 2));
        assert!(totp::verify(RFC_SECRET, &code, t + 2 * totp::STEP_SECS, 2));
        assert!(!totp::verify(RFC_SECRET, &code, t + 3 * totp::STEP_SECS, 2));
        assert!(!totp::verify(RFC_SECRET, "12345", t, 2));
    }

    #[tokio::test]
    async fn sms_challenges_are_rate_limited() {
        let sms = Arc::new(MemorySmsProvider::new());
        let verifier = TwoFactorVerifier::new(sms.clone(), 60, 2);

        verifier.request_sms_challenge(1, "+100").await.unwrap();
        let err = verifier.request_sms_challenge(1, "+100").await.unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::RateLimited);

        let code = sms.last_code("+100").unwrap();
        let mut settings = UserSettings::new(1);
        settings.sms_auth_destination = Some("+100".to_string());
        assert!(verifier
            .verify(&settings, TwoFactorMethod::Sms, "bad")
            .await
            .is_err());
        verifier
            .verify(&settings, TwoFactorMethod::Sms, &code)
            .await
            .unwrap();
    }
}
