//! Sub-accounts and the account-group resolver

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::error::{Error, Result};
use common::model::sub_account::{
    AccountGroup, MarketType, SubAccount, SubAccountStatus, FIRST_TITLE, MAIN_TITLE,
};
use common::model::{SubAccountId, UserId};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

const MAX_TITLE_LENGTH: usize = 32;

/// Sub-account storage
#[async_trait]
pub trait SubAccountRepository: Send + Sync {
    /// Insert a sub-account, assigning its ID
    async fn insert(&self, sub_account: SubAccount) -> Result<SubAccount>;
    async fn get(&self, id: SubAccountId) -> Result<Option<SubAccount>>;
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SubAccount>>;
    async fn update(&self, sub_account: &SubAccount) -> Result<()>;
}

/// In-memory sub-account storage
pub struct InMemorySubAccountRepository {
    sub_accounts: DashMap<SubAccountId, SubAccount>,
    next_id: AtomicI64,
}

impl InMemorySubAccountRepository {
    pub fn new() -> Self {
        Self {
            sub_accounts: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemorySubAccountRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubAccountRepository for InMemorySubAccountRepository {
    async fn insert(&self, mut sub_account: SubAccount) -> Result<SubAccount> {
        sub_account.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sub_accounts
            .insert(sub_account.id, sub_account.clone());
        Ok(sub_account)
    }

    async fn get(&self, id: SubAccountId) -> Result<Option<SubAccount>> {
        Ok(self.sub_accounts.get(&id).map(|s| s.clone()))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SubAccount>> {
        let mut subs: Vec<SubAccount> = self
            .sub_accounts
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        subs.sort_by_key(|s| s.id);
        Ok(subs)
    }

    async fn update(&self, sub_account: &SubAccount) -> Result<()> {
        if !self.sub_accounts.contains_key(&sub_account.id) {
            return Err(Error::NotFound("Sub-account not found".to_string()));
        }
        self.sub_accounts
            .insert(sub_account.id, sub_account.clone());
        Ok(())
    }
}

/// Editable sub-account fields
#[derive(Debug, Clone, Default)]
pub struct SubAccountUpdate {
    pub title: Option<String>,
    pub deposit_allowed: Option<bool>,
    pub withdrawal_allowed: Option<bool>,
    pub transfer_allowed: Option<bool>,
}

fn new_sub_account(user_id: UserId, title: &str, is_main: bool) -> SubAccount {
    SubAccount {
        id: 0,
        user_id,
        account_group: AccountGroup::Main,
        market_type: MarketType::Spot,
        title: title.to_string(),
        deposit_allowed: true,
        withdrawal_allowed: true,
        transfer_allowed: true,
        is_default: is_main,
        is_main,
        status: SubAccountStatus::Active,
        created_at: Utc::now(),
    }
}

/// Sub-account lifecycle and resolution
pub struct SubAccountService {
    repo: Arc<dyn SubAccountRepository>,
    max_user_sub_accounts: usize,
    /// Serializes creations per user so the cap holds
    creation_locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl SubAccountService {
    pub fn new(repo: Arc<dyn SubAccountRepository>, max_user_sub_accounts: usize) -> Self {
        Self {
            repo,
            max_user_sub_accounts,
            creation_locks: DashMap::new(),
        }
    }

    fn creation_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.creation_locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create the "main" and "first" sub-accounts of a new user
    ///
    /// Returns the existing ones when already created.
    pub async fn create_defaults(&self, user_id: UserId) -> Result<Vec<SubAccount>> {
        let lock = self.creation_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self.repo.list_for_user(user_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let main = self
            .repo
            .insert(new_sub_account(user_id, MAIN_TITLE, true))
            .await?;
        let first = self
            .repo
            .insert(new_sub_account(user_id, FIRST_TITLE, false))
            .await?;
        info!("Created default sub-accounts for user {}", user_id);
        Ok(vec![main, first])
    }

    pub async fn list(&self, user_id: UserId) -> Result<Vec<SubAccount>> {
        self.repo.list_for_user(user_id).await
    }

    /// Create a user sub-account; at most `max_user_sub_accounts` besides main
    pub async fn create(&self, user_id: UserId, title: &str) -> Result<SubAccount> {
        let title = Self::check_title(title)?;

        let lock = self.creation_lock(user_id);
        let _guard = lock.lock().await;

        let existing = self.repo.list_for_user(user_id).await?;
        if existing.iter().any(|s| s.title.eq_ignore_ascii_case(&title)) {
            return Err(Error::InvalidInput("Sub-account title is already used".to_string()));
        }
        let user_created = existing.iter().filter(|s| !s.is_main).count();
        if user_created >= self.max_user_sub_accounts {
            return Err(Error::InvalidInput(format!(
                "At most {} sub-accounts can be created",
                self.max_user_sub_accounts
            )));
        }

        let sub = self
            .repo
            .insert(new_sub_account(user_id, &title, false))
            .await?;
        info!("Created sub-account {} for user {}", sub.id, user_id);
        Ok(sub)
    }

    fn check_title(title: &str) -> Result<String> {
        let title = title.trim();
        if title.is_empty() || title.chars().count() > MAX_TITLE_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Sub-account title must be 1 to {} characters",
                MAX_TITLE_LENGTH
            )));
        }
        if title.eq_ignore_ascii_case(MAIN_TITLE) || title.parse::<i64>().is_ok() {
            return Err(Error::InvalidInput("Sub-account title is reserved".to_string()));
        }
        Ok(title.to_string())
    }

    /// Edit one of the user's sub-accounts; the main one keeps its title
    pub async fn update(
        &self,
        user_id: UserId,
        id: SubAccountId,
        update: SubAccountUpdate,
    ) -> Result<SubAccount> {
        let mut sub = self.get_owned(user_id, id).await?;

        if let Some(title) = update.title {
            if sub.is_main {
                return Err(Error::InvalidInput("The main sub-account cannot be renamed".to_string()));
            }
            let title = Self::check_title(&title)?;
            let others = self.repo.list_for_user(user_id).await?;
            if others
                .iter()
                .any(|s| s.id != id && s.title.eq_ignore_ascii_case(&title))
            {
                return Err(Error::InvalidInput("Sub-account title is already used".to_string()));
            }
            sub.title = title;
        }
        if let Some(v) = update.deposit_allowed {
            sub.deposit_allowed = v;
        }
        if let Some(v) = update.withdrawal_allowed {
            sub.withdrawal_allowed = v;
        }
        if let Some(v) = update.transfer_allowed {
            sub.transfer_allowed = v;
        }

        self.repo.update(&sub).await?;
        Ok(sub)
    }

    /// A sub-account that must belong to the user
    pub async fn get_owned(&self, user_id: UserId, id: SubAccountId) -> Result<SubAccount> {
        match self.repo.get(id).await? {
            Some(sub) if sub.user_id == user_id => Ok(sub),
            _ => Err(Error::NotFound("Sub-account not found".to_string())),
        }
    }

    /// Resolve a client-supplied account group into one of the user's sub-accounts
    ///
    /// `None` or empty selects the default sub-account, `main` the main one;
    /// otherwise the selector is matched as an ID and then as a title.
    pub async fn resolve(&self, user_id: UserId, selector: Option<&str>) -> Result<SubAccount> {
        let subs = self.repo.list_for_user(user_id).await?;
        let selector = selector.map(str::trim).filter(|s| !s.is_empty());

        let found = match selector {
            None => subs.into_iter().find(|s| s.is_default),
            Some(s) if s.eq_ignore_ascii_case(MAIN_TITLE) => {
                subs.into_iter().find(|sub| sub.is_main)
            }
            Some(s) => match s.parse::<SubAccountId>() {
                Ok(id) => subs.into_iter().find(|sub| sub.id == id),
                Err(_) => subs
                    .into_iter()
                    .find(|sub| sub.title.eq_ignore_ascii_case(s)),
            },
        };

        match found {
            Some(sub) if sub.is_active() => Ok(sub),
            _ => Err(Error::invalid_account()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> SubAccountService {
        SubAccountService::new(Arc::new(InMemorySubAccountRepository::new()), 3)
    }

    #[tokio::test]
    async fn defaults_and_cap() {
        let subs = service();
        let defaults = subs.create_defaults(1).await.unwrap();
        assert_eq!(defaults.len(), 2);
        assert!(defaults[0].is_main && defaults[0].is_default);
        assert_eq!(defaults[1].title, FIRST_TITLE);

        // "first" counts toward the cap
        subs.create(1, "savings").await.unwrap();
        subs.create(1, "bots").await.unwrap();
        let err = subs.create(1, "one-too-many").await.unwrap_err();
        assert_eq!(err.to_string(), "At most 3 sub-accounts can be created");
        assert!(subs.create(1, "main").await.is_err());
    }

    #[tokio::test]
    async fn resolver() {
        let subs = service();
        let defaults = subs.create_defaults(1).await.unwrap();
        subs.create_defaults(2).await.unwrap();

        assert_eq!(subs.resolve(1, None).await.unwrap().id, defaults[0].id);
        assert_eq!(subs.resolve(1, Some("main")).await.unwrap().id, defaults[0].id);
        assert_eq!(subs.resolve(1, Some("First")).await.unwrap().id, defaults[1].id);
        assert_eq!(
            subs.resolve(1, Some(&defaults[1].id.to_string())).await.unwrap().id,
            defaults[1].id
        );

        let err = subs.resolve(1, Some("nope")).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid account");
        // Another user's sub-account does not resolve
        assert!(subs.resolve(2, Some(&defaults[1].id.to_string())).await.is_err());
    }
}
