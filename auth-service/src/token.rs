//! Session and pre-auth tokens
//!
//! Two independent HMAC secrets sign two token families. A session token is
//! only honoured while its id is present in the [`SessionCache`]; logging out
//! or changing the password removes it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use common::error::{Error, Result};
use common::features::{flags, FeatureFlags, FlagContext};
use common::model::UserId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::AuthConfig;

/// Claims of a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    /// User ID
    pub sub: String,
    /// Role alias at issue time
    pub role: String,
    /// Pinned client IP, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Session id
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    pub fn user_id(&self) -> Result<UserId> {
        self.sub.parse().map_err(|_| Error::invalid_token())
    }
}

/// Why a pre-auth token was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreAuthStage {
    UnapprovedEmail,
    UnapprovedPhone,
    UnapprovedIp,
    AwaitingTwoFactor,
}

/// Claims of a pre-auth token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreAuthClaims {
    pub sub: String,
    pub stage: PreAuthStage,
    /// Carry the "remember me" choice to the session issued after the stage
    #[serde(default)]
    pub remember: bool,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl PreAuthClaims {
    pub fn user_id(&self) -> Result<UserId> {
        self.sub.parse().map_err(|_| Error::invalid_token())
    }
}

/// Which secret a token is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Session,
    PreAuth,
}

/// A freshly signed session
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: SessionClaims,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionIndex {
    by_id: HashMap<String, SessionEntry>,
    by_user: HashMap<UserId, HashSet<String>>,
}

/// Live session ids with a per-user index
///
/// Many readers, occasional writers.
#[derive(Debug, Default)]
pub struct SessionCache {
    index: RwLock<SessionIndex>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session
    pub fn insert(&self, session_id: &str, user_id: UserId, expires_at: DateTime<Utc>) {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.by_id.insert(
            session_id.to_string(),
            SessionEntry {
                user_id,
                expires_at,
            },
        );
        index
            .by_user
            .entry(user_id)
            .or_default()
            .insert(session_id.to_string());
    }

    /// Whether a session id is live at `now`
    pub fn is_live(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index
            .by_id
            .get(session_id)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false)
    }

    /// Remove one session; returns whether it was present
    pub fn remove(&self, session_id: &str) -> bool {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = index.by_id.remove(session_id) else {
            return false;
        };
        if let Some(ids) = index.by_user.get_mut(&entry.user_id) {
            ids.remove(session_id);
            if ids.is_empty() {
                index.by_user.remove(&entry.user_id);
            }
        }
        true
    }

    /// Remove every session of a user, returning how many were dropped
    pub fn remove_user(&self, user_id: UserId) -> usize {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let ids = index.by_user.remove(&user_id).unwrap_or_default();
        for id in &ids {
            index.by_id.remove(id);
        }
        ids.len()
    }

    /// Drop expired sessions
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<(String, UserId)> = index
            .by_id
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, entry)| (id.clone(), entry.user_id))
            .collect();
        for (id, user_id) in &expired {
            index.by_id.remove(id);
            if let Some(ids) = index.by_user.get_mut(user_id) {
                ids.remove(id);
                if ids.is_empty() {
                    index.by_user.remove(user_id);
                }
            }
        }
        expired.len()
    }

    /// Number of live sessions of a user
    pub fn count_for_user(&self, user_id: UserId) -> usize {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.by_user.get(&user_id).map(|ids| ids.len()).unwrap_or(0)
    }
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Issues and validates tokens
pub struct TokenService {
    session_keys: Keys,
    preauth_keys: Keys,
    config: Arc<AuthConfig>,
    sessions: SessionCache,
    flags: Arc<dyn FeatureFlags>,
}

impl TokenService {
    pub fn new(config: Arc<AuthConfig>, flags: Arc<dyn FeatureFlags>) -> Self {
        Self {
            session_keys: Keys::new(&config.session_secret),
            preauth_keys: Keys::new(&config.preauth_secret),
            config,
            sessions: SessionCache::new(),
            flags,
        }
    }

    /// Sign a session token and register it as live
    pub fn issue_session(
        &self,
        user_id: UserId,
        role: &str,
        remember: bool,
        bind_ip: Option<&str>,
    ) -> Result<IssuedToken> {
        let now = Utc::now();
        let ttl = if remember {
            Duration::days(self.config.remember_ttl_days)
        } else {
            Duration::minutes(self.config.session_ttl_minutes)
        };
        let expires_at = now + ttl;
        let claims = SessionClaims {
            sub: user_id.to_string(),
            role: role.to_string(),
            ip: bind_ip.map(str::to_string),
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let token = self.sign(&claims, TokenKind::Session)?;
        self.sessions.insert(&claims.jti, user_id, expires_at);
        debug!(user_id, remember, "session issued");

        Ok(IssuedToken {
            token,
            claims,
            expires_at,
        })
    }

    /// Sign a pre-auth token for a stage
    pub fn issue_preauth(
        &self,
        user_id: UserId,
        stage: PreAuthStage,
        remember: bool,
    ) -> Result<String> {
        let now = Utc::now();
        let ttl = match stage {
            PreAuthStage::UnapprovedEmail => self.config.email_preauth_ttl_minutes,
            _ => self.config.preauth_ttl_minutes,
        };
        let claims = PreAuthClaims {
            sub: user_id.to_string(),
            stage,
            remember,
            jti: Uuid::new_v4().to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(ttl)).timestamp(),
        };
        self.sign(&claims, TokenKind::PreAuth)
    }

    fn sign<T: Serialize>(&self, claims: &T, kind: TokenKind) -> Result<String> {
        let keys = self.keys(kind);
        encode(&Header::new(Algorithm::HS256), claims, &keys.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign token: {}", e)))
    }

    fn keys(&self, kind: TokenKind) -> &Keys {
        match kind {
            TokenKind::Session => &self.session_keys,
            TokenKind::PreAuth => &self.preauth_keys,
        }
    }

    /// Verify signature and expiry; the cause of a failure is never disclosed
    pub fn parse<T: DeserializeOwned>(&self, token: &str, kind: TokenKind) -> Result<T> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<T>(token, &self.keys(kind).decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("token rejected: {}", e);
                Error::invalid_token()
            })
    }

    pub fn parse_session(&self, token: &str) -> Result<SessionClaims> {
        self.parse(token, TokenKind::Session)
    }

    /// Parse a pre-auth token and check it belongs to `stage`
    pub fn parse_preauth(&self, token: &str, stage: PreAuthStage) -> Result<PreAuthClaims> {
        let claims: PreAuthClaims = self.parse(token, TokenKind::PreAuth)?;
        if claims.stage != stage {
            return Err(Error::invalid_token());
        }
        Ok(claims)
    }

    /// Check a parsed session against the revocation index
    pub fn validate_session(&self, claims: &SessionClaims) -> Result<UserId> {
        let user_id = claims.user_id()?;
        if self
            .flags
            .is_enabled(flags::SESSION_CHECK_DISABLED, &FlagContext::user(user_id))
        {
            return Ok(user_id);
        }
        if !self.sessions.is_live(&claims.jti, Utc::now()) {
            return Err(Error::invalid_token());
        }
        Ok(user_id)
    }

    /// Parse and validate in one step
    pub fn authenticate_session(&self, token: &str) -> Result<SessionClaims> {
        let claims = self.parse_session(token)?;
        self.validate_session(&claims)?;
        Ok(claims)
    }

    /// Revoke one session
    pub fn revoke(&self, claims: &SessionClaims) {
        self.sessions.remove(&claims.jti);
    }

    /// Revoke every session of a user
    pub fn revoke_all(&self, user_id: UserId) -> usize {
        let removed = self.sessions.remove_user(user_id);
        if removed > 0 {
            warn!(user_id, removed, "all sessions revoked");
        }
        removed
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::features::StaticFeatureFlags;

    fn service() -> (TokenService, Arc<StaticFeatureFlags>) {
        let flags = Arc::new(StaticFeatureFlags::new());
        let config = Arc::new(AuthConfig::with_secrets("session-secret", "preauth-secret"));
        (TokenService::new(config, flags.clone()), flags)
    }

    #[test]
    fn session_round_trip_and_revocation() {
        let (tokens, _) = service();
        let issued = tokens.issue_session(7, "member", false, Some("1.2.3.4")).unwrap();

        let claims = tokens.authenticate_session(&issued.token).unwrap();
        assert_eq!(claims.user_id().unwrap(), 7);
        assert_eq!(claims.ip.as_deref(), Some("1.2.3.4"));

        tokens.revoke(&claims);
        let err = tokens.authenticate_session(&issued.token).unwrap_err();
        assert_eq!(err.to_string(), "Invalid token");
    }

    #[test]
    fn revocation_check_can_be_disabled() {
        let (tokens, flags) = service();
        let issued = tokens.issue_session(7, "member", false, None).unwrap();
        tokens.revoke_all(7);
        assert!(tokens.authenticate_session(&issued.token).is_err());

        flags.set(flags::SESSION_CHECK_DISABLED, true);
        assert!(tokens.authenticate_session(&issued.token).is_ok());
    }

    #[test]
    fn secrets_are_not_interchangeable() {
        let (tokens, _) = service();
        let preauth = tokens
            .issue_preauth(7, PreAuthStage::AwaitingTwoFactor, false)
            .unwrap();
        assert!(tokens.parse_session(&preauth).is_err());
        assert!(tokens
            .parse_preauth(&preauth, PreAuthStage::UnapprovedIp)
            .is_err());
        assert!(tokens
            .parse_preauth(&preauth, PreAuthStage::AwaitingTwoFactor)
            .is_ok());

        let session = tokens.issue_session(7, "member", false, None).unwrap();
        assert!(tokens
            .parse::<PreAuthClaims>(&session.token, TokenKind::PreAuth)
            .is_err());
    }

    #[test]
    fn tampered_and_expired_tokens_are_rejected() {
        let (tokens, _) = service();
        let issued = tokens.issue_session(7, "member", false, None).unwrap();
        let mut tampered = issued.token.clone();
        tampered.push('x');
        assert!(tokens.parse_session(&tampered).is_err());

        let expired = SessionClaims {
            exp: Utc::now().timestamp() - 10,
            ..issued.claims.clone()
        };
        let token = tokens.sign(&expired, TokenKind::Session).unwrap();
        assert!(tokens.parse_session(&token).is_err());
    }

    #[test]
    fn cache_indexes_by_user() {
        let cache = SessionCache::new();
        let now = Utc::now();
        cache.insert("a", 1, now + Duration::minutes(5));
        cache.insert("b", 1, now + Duration::minutes(5));
        cache.insert("c", 2, now - Duration::minutes(5));

        assert_eq!(cache.count_for_user(1), 2);
        assert!(!cache.is_live("c", now));
        assert_eq!(cache.prune_expired(now), 1);
        assert_eq!(cache.remove_user(1), 2);
        assert!(!cache.is_live("a", now));
    }
}
