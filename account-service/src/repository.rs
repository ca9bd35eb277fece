//! Postgres storage for sub-accounts and withdrawal requests

use async_trait::async_trait;
use common::db::DbPool;
use common::error::Result;
use common::model::sub_account::SubAccount;
use common::model::withdraw::{WithdrawRequest, WithdrawStatus};
use common::model::{SubAccountId, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::sub_accounts::SubAccountRepository;
use crate::withdraw::WithdrawRepository;

/// Snake-case name of a unit enum variant
fn enum_to_str<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_value(value)?
        .as_str()
        .unwrap_or_default()
        .to_string())
}

fn enum_from_str<T: DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(value.to_string()))?)
}

const SUB_ACCOUNT_COLUMNS: &str = "id, user_id, account_group, market_type, title, deposit_allowed, withdrawal_allowed, transfer_allowed, is_default, is_main, status, created_at";

fn sub_account_from_row(row: &PgRow) -> Result<SubAccount> {
    let account_group: String = row.try_get("account_group")?;
    let market_type: String = row.try_get("market_type")?;
    let status: String = row.try_get("status")?;
    Ok(SubAccount {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        account_group: enum_from_str(&account_group)?,
        market_type: enum_from_str(&market_type)?,
        title: row.try_get("title")?,
        deposit_allowed: row.try_get("deposit_allowed")?,
        withdrawal_allowed: row.try_get("withdrawal_allowed")?,
        transfer_allowed: row.try_get("transfer_allowed")?,
        is_default: row.try_get("is_default")?,
        is_main: row.try_get("is_main")?,
        status: enum_from_str(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

/// Sub-accounts in Postgres
pub struct PostgresSubAccountRepository {
    pool: DbPool,
}

impl PostgresSubAccountRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubAccountRepository for PostgresSubAccountRepository {
    async fn insert(&self, sub_account: SubAccount) -> Result<SubAccount> {
        debug!("Creating sub-account {} for user {}", sub_account.title, sub_account.user_id);
        let row = sqlx::query(&format!(
            "INSERT INTO sub_accounts (user_id, account_group, market_type, title, deposit_allowed,
                 withdrawal_allowed, transfer_allowed, is_default, is_main, status, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {}",
            SUB_ACCOUNT_COLUMNS
        ))
        .bind(sub_account.user_id)
        .bind(enum_to_str(&sub_account.account_group)?)
        .bind(enum_to_str(&sub_account.market_type)?)
        .bind(&sub_account.title)
        .bind(sub_account.deposit_allowed)
        .bind(sub_account.withdrawal_allowed)
        .bind(sub_account.transfer_allowed)
        .bind(sub_account.is_default)
        .bind(sub_account.is_main)
        .bind(enum_to_str(&sub_account.status)?)
        .bind(sub_account.created_at)
        .fetch_one(&self.pool)
        .await?;
        sub_account_from_row(&row)
    }

    async fn get(&self, id: SubAccountId) -> Result<Option<SubAccount>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sub_accounts WHERE id = $1",
            SUB_ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sub_account_from_row).transpose()
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<SubAccount>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sub_accounts WHERE user_id = $1 ORDER BY id",
            SUB_ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sub_account_from_row).collect()
    }

    async fn update(&self, sub_account: &SubAccount) -> Result<()> {
        sqlx::query(
            "UPDATE sub_accounts SET title = $2, deposit_allowed = $3, withdrawal_allowed = $4,
                 transfer_allowed = $5, status = $6
             WHERE id = $1",
        )
        .bind(sub_account.id)
        .bind(&sub_account.title)
        .bind(sub_account.deposit_allowed)
        .bind(sub_account.withdrawal_allowed)
        .bind(sub_account.transfer_allowed)
        .bind(enum_to_str(&sub_account.status)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const WITHDRAW_COLUMNS: &str = "id, user_id, sub_account_id, coin_symbol, amount, fee_amount, destination, external_system, status, action_id, external_id, created_at, updated_at";

fn withdraw_from_row(row: &PgRow) -> Result<WithdrawRequest> {
    let external_system: String = row.try_get("external_system")?;
    let status: String = row.try_get("status")?;
    Ok(WithdrawRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        sub_account_id: row.try_get("sub_account_id")?,
        coin_symbol: row.try_get("coin_symbol")?,
        amount: row.try_get("amount")?,
        fee_amount: row.try_get("fee_amount")?,
        destination: row.try_get("destination")?,
        external_system: enum_from_str(&external_system)?,
        status: enum_from_str(&status)?,
        action_id: row.try_get("action_id")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Withdrawal requests in Postgres
pub struct PostgresWithdrawRepository {
    pool: DbPool,
}

impl PostgresWithdrawRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WithdrawRepository for PostgresWithdrawRepository {
    async fn insert(&self, request: &WithdrawRequest) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO withdraw_requests ({})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            WITHDRAW_COLUMNS
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.sub_account_id)
        .bind(&request.coin_symbol)
        .bind(request.amount)
        .bind(request.fee_amount)
        .bind(&request.destination)
        .bind(enum_to_str(&request.external_system)?)
        .bind(enum_to_str(&request.status)?)
        .bind(request.action_id)
        .bind(&request.external_id)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WithdrawRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM withdraw_requests WHERE id = $1",
            WITHDRAW_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(withdraw_from_row).transpose()
    }

    async fn save(&self, request: &WithdrawRequest) -> Result<()> {
        sqlx::query(
            "UPDATE withdraw_requests SET status = $2, action_id = $3, external_id = $4, updated_at = $5
             WHERE id = $1",
        )
        .bind(request.id)
        .bind(enum_to_str(&request.status)?)
        .bind(request.action_id)
        .bind(&request.external_id)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<WithdrawRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM withdraw_requests WHERE user_id = $1 ORDER BY created_at DESC",
            WITHDRAW_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(withdraw_from_row).collect()
    }

    async fn list_by_status(&self, status: WithdrawStatus) -> Result<Vec<WithdrawRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM withdraw_requests WHERE status = $1 ORDER BY created_at",
            WITHDRAW_COLUMNS
        ))
        .bind(enum_to_str(&status)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(withdraw_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::withdraw::ExternalSystem;

    #[test]
    fn enum_columns_use_snake_case() {
        assert_eq!(enum_to_str(&ExternalSystem::ProviderA).unwrap(), "provider_a");
        assert_eq!(enum_to_str(&WithdrawStatus::Processing).unwrap(), "processing");
        let status: WithdrawStatus = enum_from_str("cancelled").unwrap();
        assert_eq!(status, WithdrawStatus::Cancelled);
        assert!(enum_from_str::<WithdrawStatus>("lost").is_err());
    }
}
