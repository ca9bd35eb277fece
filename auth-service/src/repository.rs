//! Repository for users, settings and known IPs

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::db::DbPool;
use common::error::{Error, Result};
use common::model::user::{
    IpApproval, IpStatus, TwoFactorMethod, User, UserSettings, UserStatus,
};
use common::model::UserId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;

/// Fields needed to create a user
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub status: UserStatus,
}

/// User repository trait defining the interface for identity storage
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create a user together with default settings; duplicate emails are rejected
    async fn create_user(&self, new_user: NewUser) -> Result<User>;

    /// Get a user by ID
    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Get a user by normalized email
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get a user by phone number
    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>>;

    /// Replace the password hash
    async fn update_password_hash(&self, id: UserId, password_hash: &str) -> Result<()>;

    /// Change the user status
    async fn update_status(&self, id: UserId, status: UserStatus) -> Result<()>;

    /// Change the role alias
    async fn update_role(&self, id: UserId, role: &str) -> Result<()>;

    /// Get settings, creating defaults when missing
    async fn get_settings(&self, id: UserId) -> Result<UserSettings>;

    /// Persist settings
    async fn save_settings(&self, settings: &UserSettings) -> Result<()>;

    /// Status of an IP for a user, if it was ever seen
    async fn ip_status(&self, id: UserId, ip: &str) -> Result<Option<IpStatus>>;

    /// Record an IP as pending; no-op when it is already known
    async fn add_pending_ip(&self, id: UserId, ip: &str) -> Result<()>;

    /// Record an IP as approved; returns false when it was never seen
    async fn approve_ip(&self, id: UserId, ip: &str) -> Result<bool>;

    /// Record an IP as approved even when unseen
    async fn trust_ip(&self, id: UserId, ip: &str) -> Result<()>;

    /// All IPs known for a user
    async fn list_ips(&self, id: UserId) -> Result<Vec<IpApproval>>;
}

fn already_exists() -> Error {
    Error::Conflict("User already exists".to_string())
}

/// In-memory repository for identity data
pub struct InMemoryUserRepository {
    users: DashMap<UserId, User>,
    /// Lowercased email to user ID; entry insertion enforces uniqueness
    emails: DashMap<String, UserId>,
    settings: DashMap<UserId, UserSettings>,
    ips: DashMap<(UserId, String), IpApproval>,
    next_id: AtomicI64,
}

impl InMemoryUserRepository {
    /// Create a new in-memory user repository
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            emails: DashMap::new(),
            settings: DashMap::new(),
            ips: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let key = new_user.email.to_lowercase();
        let id = match self.emails.entry(key) {
            Entry::Occupied(_) => return Err(already_exists()),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(id);
                id
            }
        };

        let now = Utc::now();
        let user = User {
            id,
            email: new_user.email,
            phone: new_user.phone,
            password_hash: new_user.password_hash,
            role: new_user.role,
            status: new_user.status,
            email_send_allowed: true,
            kyc_reference: None,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(id, user.clone());
        self.settings.insert(id, UserSettings::new(id));
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let id = match self.emails.get(&email.to_lowercase()) {
            Some(id) => *id,
            None => return Ok(None),
        };
        self.get_user(id).await
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.phone.as_deref() == Some(phone))
            .map(|u| u.clone()))
    }

    async fn update_password_hash(&self, id: UserId, password_hash: &str) -> Result<()> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
        user.password_hash = password_hash.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn update_status(&self, id: UserId, status: UserStatus) -> Result<()> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
        user.status = status;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn update_role(&self, id: UserId, role: &str) -> Result<()> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound("User not found".to_string()))?;
        user.role = role.to_string();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn get_settings(&self, id: UserId) -> Result<UserSettings> {
        Ok(self
            .settings
            .entry(id)
            .or_insert_with(|| UserSettings::new(id))
            .clone())
    }

    async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        self.settings.insert(settings.user_id, settings.clone());
        Ok(())
    }

    async fn ip_status(&self, id: UserId, ip: &str) -> Result<Option<IpStatus>> {
        Ok(self.ips.get(&(id, ip.to_string())).map(|e| e.status))
    }

    async fn add_pending_ip(&self, id: UserId, ip: &str) -> Result<()> {
        self.ips
            .entry((id, ip.to_string()))
            .or_insert_with(|| IpApproval {
                user_id: id,
                ip: ip.to_string(),
                status: IpStatus::Pending,
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn approve_ip(&self, id: UserId, ip: &str) -> Result<bool> {
        match self.ips.get_mut(&(id, ip.to_string())) {
            Some(mut entry) => {
                entry.status = IpStatus::Approved;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn trust_ip(&self, id: UserId, ip: &str) -> Result<()> {
        self.ips.insert(
            (id, ip.to_string()),
            IpApproval {
                user_id: id,
                ip: ip.to_string(),
                status: IpStatus::Approved,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn list_ips(&self, id: UserId) -> Result<Vec<IpApproval>> {
        let mut ips: Vec<IpApproval> = self
            .ips
            .iter()
            .filter(|e| e.key().0 == id)
            .map(|e| e.value().clone())
            .collect();
        ips.sort_by_key(|e| e.created_at);
        Ok(ips)
    }
}

/// PostgreSQL repository for identity data
pub struct PostgresUserRepository {
    pool: DbPool,
}

impl PostgresUserRepository {
    /// Create a repository on an existing pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, email, phone, password_hash, role, status, email_send_allowed, kyc_reference, created_at, updated_at";

fn user_from_row(row: &PgRow) -> Result<User> {
    let status: String = row.try_get("status")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        password_hash: row.try_get("password_hash")?,
        role: row.try_get("role")?,
        status: UserStatus::parse(&status)?,
        email_send_allowed: row.try_get("email_send_allowed")?,
        kyc_reference: row.try_get("kyc_reference")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn method_to_str(method: TwoFactorMethod) -> &'static str {
    match method {
        TwoFactorMethod::GoogleAuth => "google_auth",
        TwoFactorMethod::Sms => "sms",
    }
}

fn method_from_str(value: &str) -> Option<TwoFactorMethod> {
    match value {
        "google_auth" => Some(TwoFactorMethod::GoogleAuth),
        "sms" => Some(TwoFactorMethod::Sms),
        _ => None,
    }
}

fn ip_status_from_str(value: &str) -> IpStatus {
    if value == "approved" {
        IpStatus::Approved
    } else {
        IpStatus::Pending
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        debug!("Creating user in database: {}", new_user.email);

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO users (email, phone, password_hash, role, status)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (email) DO NOTHING
             RETURNING {}",
            USER_COLUMNS
        ))
        .bind(new_user.email.to_lowercase())
        .bind(&new_user.phone)
        .bind(&new_user.password_hash)
        .bind(&new_user.role)
        .bind(new_user.status.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let user = match row {
            Some(row) => user_from_row(&row)?,
            None => return Err(already_exists()),
        };

        sqlx::query("INSERT INTO user_settings (user_id) VALUES ($1)")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {} FROM users WHERE phone = $1", USER_COLUMNS))
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_password_hash(&self, id: UserId, password_hash: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    async fn update_status(&self, id: UserId, status: UserStatus) -> Result<()> {
        let result = sqlx::query("UPDATE users SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    async fn update_role(&self, id: UserId, role: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET role = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(role)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound("User not found".to_string()));
        }
        Ok(())
    }

    async fn get_settings(&self, id: UserId) -> Result<UserSettings> {
        let row = sqlx::query(
            "SELECT google_auth_secret, sms_auth_destination, primary_two_factor,
                    anti_phishing_code, detect_ip_change, trade_password_hash,
                    selected_layout, fees_paid_with_native
             FROM user_settings WHERE user_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(UserSettings::new(id));
        };

        let primary: Option<String> = row.try_get("primary_two_factor")?;
        Ok(UserSettings {
            user_id: id,
            google_auth_secret: row.try_get("google_auth_secret")?,
            sms_auth_destination: row.try_get("sms_auth_destination")?,
            primary_two_factor: primary.as_deref().and_then(method_from_str),
            anti_phishing_code: row.try_get("anti_phishing_code")?,
            detect_ip_change: row.try_get("detect_ip_change")?,
            trade_password_hash: row.try_get("trade_password_hash")?,
            selected_layout: row.try_get("selected_layout")?,
            fees_paid_with_native: row.try_get("fees_paid_with_native")?,
        })
    }

    async fn save_settings(&self, settings: &UserSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_settings (user_id, google_auth_secret, sms_auth_destination,
                    primary_two_factor, anti_phishing_code, detect_ip_change,
                    trade_password_hash, selected_layout, fees_paid_with_native)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (user_id) DO UPDATE SET
                google_auth_secret = $2,
                sms_auth_destination = $3,
                primary_two_factor = $4,
                anti_phishing_code = $5,
                detect_ip_change = $6,
                trade_password_hash = $7,
                selected_layout = $8,
                fees_paid_with_native = $9",
        )
        .bind(settings.user_id)
        .bind(&settings.google_auth_secret)
        .bind(&settings.sms_auth_destination)
        .bind(settings.primary_two_factor.map(method_to_str))
        .bind(&settings.anti_phishing_code)
        .bind(settings.detect_ip_change)
        .bind(&settings.trade_password_hash)
        .bind(&settings.selected_layout)
        .bind(settings.fees_paid_with_native)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ip_status(&self, id: UserId, ip: &str) -> Result<Option<IpStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM user_ips WHERE user_id = $1 AND ip = $2")
                .bind(id)
                .bind(ip)
                .fetch_optional(&self.pool)
                .await?;
        Ok(status.as_deref().map(ip_status_from_str))
    }

    async fn add_pending_ip(&self, id: UserId, ip: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_ips (user_id, ip, status) VALUES ($1, $2, 'pending')
             ON CONFLICT (user_id, ip) DO NOTHING",
        )
        .bind(id)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn approve_ip(&self, id: UserId, ip: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE user_ips SET status = 'approved' WHERE user_id = $1 AND ip = $2")
                .bind(id)
                .bind(ip)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn trust_ip(&self, id: UserId, ip: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_ips (user_id, ip, status) VALUES ($1, $2, 'approved')
             ON CONFLICT (user_id, ip) DO UPDATE SET status = 'approved'",
        )
        .bind(id)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ips(&self, id: UserId) -> Result<Vec<IpApproval>> {
        let rows = sqlx::query(
            "SELECT ip, status, created_at FROM user_ips WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut ips = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            ips.push(IpApproval {
                user_id: id,
                ip: row.try_get("ip")?,
                status: ip_status_from_str(&status),
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            phone: None,
            password_hash: "hash".to_string(),
            role: "member".to_string(),
            status: UserStatus::Pending,
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected_case_insensitively() {
        let repo = InMemoryUserRepository::new();
        repo.create_user(new_user("alice@example.com")).await.unwrap();
        let err = repo.create_user(new_user("Alice@Example.com")).await.unwrap_err();
        assert_eq!(err.to_string(), "User already exists");
    }

    #[tokio::test]
    async fn pending_ip_becomes_approved() {
        let repo = InMemoryUserRepository::new();
        let user = repo.create_user(new_user("bob@example.com")).await.unwrap();

        assert!(!repo.approve_ip(user.id, "10.0.0.1").await.unwrap());
        repo.add_pending_ip(user.id, "10.0.0.1").await.unwrap();
        assert_eq!(
            repo.ip_status(user.id, "10.0.0.1").await.unwrap(),
            Some(IpStatus::Pending)
        );
        assert!(repo.approve_ip(user.id, "10.0.0.1").await.unwrap());
        assert_eq!(
            repo.ip_status(user.id, "10.0.0.1").await.unwrap(),
            Some(IpStatus::Approved)
        );
    }
}
