//! API keys
//!
//! v1 keys are a single secret. v2 keys are a public/private pair: presenting
//! the public part grants read-only access, the private part grants write
//! access limited by the key's capabilities. Only SHA-256 hashes of secrets
//! are stored; the secret itself is shown once, at creation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::error::{Error, Result};
use common::model::action::{Action, ActionType};
use common::model::api_key::{ApiKey, ApiKeyCapabilities, ApiKeyStatus, ApiKeyVersion};
use common::model::principal::{ApiKeyGrant, KeyAccess};
use common::model::{ApiKeyId, UserId};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::actions::{ActionEffect, ActionService, Recipient};

/// API key storage
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Insert a key, assigning its ID
    async fn insert(&self, key: ApiKey) -> Result<ApiKey>;
    async fn get(&self, id: ApiKeyId) -> Result<Option<ApiKey>>;
    async fn find_by_public(&self, public_key: &str) -> Result<Option<ApiKey>>;
    async fn find_by_private_hash(&self, hash: &str) -> Result<Option<ApiKey>>;
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ApiKey>>;
    async fn set_status(&self, id: ApiKeyId, status: ApiKeyStatus) -> Result<()>;
    async fn delete(&self, id: ApiKeyId) -> Result<bool>;
}

/// In-memory API key storage
pub struct InMemoryApiKeyRepository {
    keys: DashMap<ApiKeyId, ApiKey>,
    next_id: AtomicI64,
}

impl InMemoryApiKeyRepository {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryApiKeyRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn insert(&self, mut key: ApiKey) -> Result<ApiKey> {
        key.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn get(&self, id: ApiKeyId) -> Result<Option<ApiKey>> {
        Ok(self.keys.get(&id).map(|k| k.clone()))
    }

    async fn find_by_public(&self, public_key: &str) -> Result<Option<ApiKey>> {
        Ok(self
            .keys
            .iter()
            .find(|k| k.public_key == public_key)
            .map(|k| k.clone()))
    }

    async fn find_by_private_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        Ok(self
            .keys
            .iter()
            .find(|k| k.private_key_hash == hash)
            .map(|k| k.clone()))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ApiKey>> {
        let mut keys: Vec<ApiKey> = self
            .keys
            .iter()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.clone())
            .collect();
        keys.sort_by_key(|k| k.id);
        Ok(keys)
    }

    async fn set_status(&self, id: ApiKeyId, status: ApiKeyStatus) -> Result<()> {
        let mut key = self
            .keys
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound("API key not found".to_string()))?;
        key.status = status;
        Ok(())
    }

    async fn delete(&self, id: ApiKeyId) -> Result<bool> {
        Ok(self.keys.remove(&id).is_some())
    }
}

/// SHA-256 of a secret, hex encoded
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Parameters of a new key
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub version: ApiKeyVersion,
    pub capabilities: ApiKeyCapabilities,
    pub allowed_ips: Vec<String>,
}

/// A created key together with its one-time secret
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub key: ApiKey,
    /// Private part; never retrievable again
    pub secret: String,
    pub action: Action,
}

/// A successfully authenticated key
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub key: ApiKey,
    pub grant: ApiKeyGrant,
}

fn invalid_key() -> Error {
    Error::Unauthorized("Invalid API key".to_string())
}

/// API key lifecycle and lookup
pub struct ApiKeyService {
    repo: Arc<dyn ApiKeyRepository>,
    actions: Arc<ActionService>,
}

impl ApiKeyService {
    pub fn new(repo: Arc<dyn ApiKeyRepository>, actions: Arc<ActionService>) -> Self {
        Self { repo, actions }
    }

    /// Create a pending key and the action that activates it
    pub async fn create(
        &self,
        recipient: &Recipient,
        role: &str,
        request: NewApiKey,
    ) -> Result<CreatedApiKey> {
        for ip in &request.allowed_ips {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(Error::InvalidInput(format!("Invalid IP address: {}", ip)));
            }
        }

        let secret = random_hex(32);
        let capabilities = match request.version {
            ApiKeyVersion::V1 => ApiKeyCapabilities::all(),
            ApiKeyVersion::V2 => request.capabilities,
        };
        let key = self
            .repo
            .insert(ApiKey {
                id: 0,
                user_id: recipient.user_id,
                version: request.version,
                public_key: random_hex(16),
                private_key_hash: hash_secret(&secret),
                role: role.to_string(),
                capabilities,
                allowed_ips: request.allowed_ips,
                status: ApiKeyStatus::Pending,
                created_at: Utc::now(),
            })
            .await?;

        let action_type = match key.version {
            ApiKeyVersion::V1 => ActionType::ApiKey,
            ApiKeyVersion::V2 => ActionType::ApiKeyV2,
        };
        let summary = [("API key", key.public_key.clone())];
        let action = match self
            .actions
            .create(
                recipient,
                action_type,
                serde_json::json!({ "api_key_id": key.id }),
                &summary,
            )
            .await
        {
            Ok(action) => action,
            Err(e) => {
                self.repo.delete(key.id).await?;
                return Err(e);
            }
        };

        info!(user_id = key.user_id, key_id = key.id, "API key created, awaiting approval");
        Ok(CreatedApiKey {
            key,
            secret,
            action,
        })
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<ApiKey>> {
        self.repo.list_for_user(user_id).await
    }

    /// Delete one of the user's keys
    pub async fn delete(&self, user_id: UserId, id: ApiKeyId) -> Result<()> {
        match self.repo.get(id).await? {
            Some(key) if key.user_id == user_id => {
                self.repo.delete(id).await?;
                info!(user_id, key_id = id, "API key deleted");
                Ok(())
            }
            _ => Err(Error::NotFound("API key not found".to_string())),
        }
    }

    /// Resolve a presented key
    pub async fn authenticate(
        &self,
        version: ApiKeyVersion,
        presented: &str,
        ip: &str,
    ) -> Result<AuthenticatedKey> {
        let (key, access) = match version {
            ApiKeyVersion::V1 => {
                let key = self.repo.find_by_private_hash(&hash_secret(presented)).await?;
                (key, KeyAccess::Write)
            }
            ApiKeyVersion::V2 => match self.repo.find_by_public(presented).await? {
                Some(key) => (Some(key), KeyAccess::ReadOnly),
                None => (
                    self.repo.find_by_private_hash(&hash_secret(presented)).await?,
                    KeyAccess::Write,
                ),
            },
        };

        let key = key.ok_or_else(invalid_key)?;
        if key.version != version || key.status != ApiKeyStatus::Active {
            return Err(invalid_key());
        }
        if !key.ip_allowed(ip) {
            return Err(Error::AccessDenied("IP address is not allowed for this API key".to_string()));
        }

        let grant = ApiKeyGrant {
            key_id: key.id,
            access,
            capabilities: key.capabilities,
        };
        Ok(AuthenticatedKey { key, grant })
    }
}

/// Activates the key referenced by an approved action
pub struct ApiKeyActivation {
    repo: Arc<dyn ApiKeyRepository>,
}

impl ApiKeyActivation {
    pub fn new(repo: Arc<dyn ApiKeyRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ActionEffect for ApiKeyActivation {
    async fn apply(&self, action: &Action) -> Result<()> {
        let id = action
            .data
            .get("api_key_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| Error::Internal("action has no api_key_id".to_string()))?;
        let key = self
            .repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound("API key not found".to_string()))?;
        if key.user_id != action.user_id {
            return Err(Error::AccessDenied("API key belongs to another user".to_string()));
        }
        self.repo.set_status(id, ApiKeyStatus::Active).await?;
        info!(key_id = id, "API key activated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{key_from_email, InMemoryActionRepository};
    use common::mail::{MailDispatcher, MemoryMailer};

    async fn setup() -> (ApiKeyService, Arc<ActionService>, Arc<MemoryMailer>) {
        let mailer = Arc::new(MemoryMailer::new());
        let actions = Arc::new(ActionService::new(
            Arc::new(InMemoryActionRepository::new()),
            MailDispatcher::spawn(mailer.clone(), 1, 8),
            "http://localhost",
        ));
        let repo: Arc<dyn ApiKeyRepository> = Arc::new(InMemoryApiKeyRepository::new());
        actions.register_effect(ActionType::ApiKeyV2, Arc::new(ApiKeyActivation::new(repo.clone())));
        actions.register_effect(ActionType::ApiKey, Arc::new(ApiKeyActivation::new(repo.clone())));
        (ApiKeyService::new(repo, actions.clone()), actions, mailer)
    }

    fn recipient() -> Recipient {
        Recipient {
            user_id: 1,
            email: "alice@example.com".to_string(),
            anti_phishing_code: None,
        }
    }

    async fn approve_all(actions: &ActionService, mailer: &MemoryMailer, action: &Action) {
        for mail in mailer.sent() {
            if mail.body.contains(&action.id.to_string()) {
                let key = key_from_email(&mail.body).unwrap();
                actions.approve(action.id, &key).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn v2_public_part_is_read_only() {
        let (service, actions, mailer) = setup().await;
        let created = service
            .create(
                &recipient(),
                "member",
                NewApiKey {
                    version: ApiKeyVersion::V2,
                    capabilities: ApiKeyCapabilities {
                        trading: true,
                        ..Default::default()
                    },
                    allowed_ips: vec!["10.0.0.1".to_string()],
                },
            )
            .await
            .unwrap();

        // Pending until both approval keys are used
        assert!(service
            .authenticate(ApiKeyVersion::V2, &created.secret, "10.0.0.1")
            .await
            .is_err());
        approve_all(&actions, &mailer, &created.action).await;

        let read = service
            .authenticate(ApiKeyVersion::V2, &created.key.public_key, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(read.grant.access, KeyAccess::ReadOnly);

        let write = service
            .authenticate(ApiKeyVersion::V2, &created.secret, "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(write.grant.access, KeyAccess::Write);
        assert!(write.grant.capabilities.trading);
        assert!(!write.grant.capabilities.withdrawal);

        let err = service
            .authenticate(ApiKeyVersion::V2, &created.secret, "10.0.0.2")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::AccessDenied);

        // A v2 secret is not a v1 key
        assert!(service
            .authenticate(ApiKeyVersion::V1, &created.secret, "10.0.0.1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn delete_is_scoped_to_owner() {
        let (service, _, _) = setup().await;
        let created = service
            .create(
                &recipient(),
                "member",
                NewApiKey {
                    version: ApiKeyVersion::V1,
                    capabilities: ApiKeyCapabilities::default(),
                    allowed_ips: vec![],
                },
            )
            .await
            .unwrap();
        assert!(created.key.capabilities.withdrawal);
        assert!(service.delete(2, created.key.id).await.is_err());
        service.delete(1, created.key.id).await.unwrap();
        assert!(service.list(1).await.unwrap().is_empty());
    }
}
