//! User identity service

use std::sync::Arc;

use common::error::{Error, Result};
use common::model::user::{User, UserSettings, UserStatus};
use common::model::UserId;
use tracing::{debug, info};

use crate::password;
use crate::repository::{NewUser, UserRepository};
use crate::token::TokenService;

/// Fields accepted when creating a user
#[derive(Debug, Clone)]
pub struct CreateUser {
    pub email: String,
    pub phone: Option<String>,
    pub password: String,
    pub role: String,
}

/// Trim, lowercase and sanity-check an email address
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid {
        return Err(Error::InvalidInput("Invalid email".to_string()));
    }
    Ok(email)
}

/// Only active users may log in or use their keys
pub fn ensure_active(user: &User) -> Result<()> {
    match user.status {
        UserStatus::Active => Ok(()),
        UserStatus::Pending => Err(Error::AccessDenied("Email is not confirmed".to_string())),
        UserStatus::Blocked | UserStatus::Removed => {
            Err(Error::AccessDenied("Account is blocked".to_string()))
        }
    }
}

/// Lookups and credential changes
pub struct IdentityService {
    repo: Arc<dyn UserRepository>,
    tokens: Arc<TokenService>,
}

impl IdentityService {
    pub fn new(repo: Arc<dyn UserRepository>, tokens: Arc<TokenService>) -> Self {
        Self { repo, tokens }
    }

    pub fn repository(&self) -> &Arc<dyn UserRepository> {
        &self.repo
    }

    pub async fn lookup_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email)?;
        self.repo.find_by_email(&email).await
    }

    pub async fn lookup_by_phone(&self, phone: &str) -> Result<Option<User>> {
        self.repo.find_by_phone(phone.trim()).await
    }

    /// Load a user that must exist
    pub async fn get(&self, id: UserId) -> Result<User> {
        self.repo
            .get_user(id)
            .await?
            .ok_or_else(|| Error::NotFound("User not found".to_string()))
    }

    /// Load a user that must exist and be active
    pub async fn get_active(&self, id: UserId) -> Result<User> {
        let user = self.get(id).await?;
        ensure_active(&user)?;
        Ok(user)
    }

    /// Create a pending user after the password policy check
    pub async fn create(&self, request: CreateUser) -> Result<User> {
        let email = normalize_email(&request.email)?;
        password::check_policy(&request.password)?;
        let password_hash = password::hash_password(&request.password)?;

        let user = self
            .repo
            .create_user(NewUser {
                email,
                phone: request.phone,
                password_hash,
                role: request.role,
                status: UserStatus::Pending,
            })
            .await?;

        info!(user_id = user.id, "User created");
        Ok(user)
    }

    /// Email and password check; the error does not say which one was wrong
    pub async fn verify_credentials(&self, email: &str, password: &str) -> Result<User> {
        let invalid = || Error::Unauthorized("Invalid email or password".to_string());
        let user = match self.lookup_by_email(email).await {
            Ok(Some(user)) => user,
            Ok(None) | Err(Error::InvalidInput(_)) => return Err(invalid()),
            Err(e) => return Err(e),
        };
        if !password::verify_password(&user.password_hash, password) {
            debug!(user_id = user.id, "password mismatch");
            return Err(invalid());
        }
        Ok(user)
    }

    /// Replace the password and revoke every session of the user
    pub async fn update_password(&self, id: UserId, new_password: &str) -> Result<usize> {
        password::check_policy(new_password)?;
        let hash = password::hash_password(new_password)?;
        self.repo.update_password_hash(id, &hash).await?;
        let revoked = self.tokens.revoke_all(id);
        info!(user_id = id, revoked, "Password updated");
        Ok(revoked)
    }

    /// Change the password after checking the current one
    pub async fn change_password(
        &self,
        id: UserId,
        current_password: &str,
        new_password: &str,
    ) -> Result<usize> {
        let user = self.get(id).await?;
        if !password::verify_password(&user.password_hash, current_password) {
            return Err(Error::InvalidInput("Current password is incorrect".to_string()));
        }
        self.update_password(id, new_password).await
    }

    pub async fn update_status(&self, id: UserId, status: UserStatus) -> Result<()> {
        self.repo.update_status(id, status).await?;
        if matches!(status, UserStatus::Blocked | UserStatus::Removed) {
            self.tokens.revoke_all(id);
        }
        Ok(())
    }

    /// Takes effect on the next request; sessions carry no authority of their own
    pub async fn update_role(&self, id: UserId, role: &str) -> Result<()> {
        self.repo.update_role(id, role).await?;
        info!(user_id = id, role, "role changed");
        Ok(())
    }

    pub async fn settings(&self, id: UserId) -> Result<UserSettings> {
        self.repo.get_settings(id).await
    }

    pub async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        self.repo.save_settings(settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization() {
        assert_eq!(normalize_email(" Alice@Example.COM ").unwrap(), "alice@example.com");
        assert!(normalize_email("alice").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("alice@localhost").is_err());
        assert!(normalize_email("a@b@c.com").is_err());
    }
}
