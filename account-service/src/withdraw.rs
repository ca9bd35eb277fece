//! Withdrawal state machine
//!
//! ```text
//! pending --both keys--> approved --relay--> processing --custody--> completed
//!    |                      |                                   \--> failed
//!    +--cancel / expiry-----+--admin cancel--> cancelled
//! ```
//!
//! The gross amount stays in `in_withdrawals` while the request is pending,
//! approved or processing. Cancellation, expiry and custody failure release it
//! back to `available`; completion consumes it.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use auth_service::actions::{ActionEffect, ActionService, Recipient};
use chrono::{DateTime, Duration, Utc};
use common::cache::DirtyBalances;
use common::decimal::{parse_strict, precision, Decimal, Quantity};
use common::error::{Error, Result};
use common::model::action::{Action, ActionType};
use common::model::withdraw::{ExternalSystem, WithdrawRequest, WithdrawStatus};
use common::locks::KeyedLocks;
use common::model::UserId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coins::CoinCatalog;
use crate::config::AccountServiceConfig;
use crate::custody::CustodyClient;
use crate::funds::{FundsEngine, RateSource};
use crate::lease::LeaseManager;
use crate::sub_accounts::SubAccountService;

/// Withdrawal request storage
#[async_trait]
pub trait WithdrawRepository: Send + Sync {
    async fn insert(&self, request: &WithdrawRequest) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<WithdrawRequest>>;
    async fn save(&self, request: &WithdrawRequest) -> Result<()>;
    /// Newest first
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<WithdrawRequest>>;
    /// Oldest first
    async fn list_by_status(&self, status: WithdrawStatus) -> Result<Vec<WithdrawRequest>>;
}

/// In-memory withdrawal storage
#[derive(Default)]
pub struct InMemoryWithdrawRepository {
    requests: DashMap<Uuid, WithdrawRequest>,
}

impl InMemoryWithdrawRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WithdrawRepository for InMemoryWithdrawRepository {
    async fn insert(&self, request: &WithdrawRequest) -> Result<()> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WithdrawRequest>> {
        Ok(self.requests.get(&id).map(|r| r.clone()))
    }

    async fn save(&self, request: &WithdrawRequest) -> Result<()> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<WithdrawRequest>> {
        let mut requests: Vec<WithdrawRequest> = self
            .requests
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.clone())
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn list_by_status(&self, status: WithdrawStatus) -> Result<Vec<WithdrawRequest>> {
        let mut requests: Vec<WithdrawRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }
}

/// A withdrawal as submitted by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawInput {
    /// Account-group selector; the default sub-account when absent
    pub account: Option<String>,
    pub coin: String,
    /// Gross amount, fee included
    pub amount: String,
    pub address: String,
    #[serde(default)]
    pub external_system: ExternalSystem,
}

/// Final state reported by custody
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodyOutcome {
    Completed,
    Failed,
}

/// Admission, approval and settlement of withdrawals
pub struct WithdrawService {
    config: Arc<AccountServiceConfig>,
    coins: Arc<CoinCatalog>,
    subs: Arc<SubAccountService>,
    funds: Arc<dyn FundsEngine>,
    rates: Arc<dyn RateSource>,
    leases: Arc<LeaseManager>,
    dirty: Arc<DirtyBalances>,
    repo: Arc<dyn WithdrawRepository>,
    actions: Arc<ActionService>,
    custody: Arc<dyn CustodyClient>,
    /// Serializes admissions of one user so the 24h limit holds
    admission_locks: KeyedLocks<UserId>,
}

impl WithdrawService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AccountServiceConfig>,
        coins: Arc<CoinCatalog>,
        subs: Arc<SubAccountService>,
        funds: Arc<dyn FundsEngine>,
        rates: Arc<dyn RateSource>,
        leases: Arc<LeaseManager>,
        dirty: Arc<DirtyBalances>,
        repo: Arc<dyn WithdrawRepository>,
        actions: Arc<ActionService>,
        custody: Arc<dyn CustodyClient>,
    ) -> Self {
        Self {
            config,
            coins,
            subs,
            funds,
            rates,
            leases,
            dirty,
            repo,
            actions,
            custody,
            admission_locks: KeyedLocks::new(),
        }
    }

    /// Register the approval effect for withdraw actions
    pub fn register_effect(self: &Arc<Self>) {
        self.actions.register_effect(
            ActionType::Withdraw,
            Arc::new(WithdrawApproval {
                service: Arc::downgrade(self),
            }),
        );
    }

    /// Admit a withdrawal: validate, lock the gross amount, persist and email
    /// the two approval keys
    pub async fn admit(&self, recipient: &Recipient, input: WithdrawInput) -> Result<WithdrawRequest> {
        let user_id = recipient.user_id;
        let system = input.external_system;

        let catalog_coin = self
            .coins
            .get(&input.coin)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown coin: {}", input.coin)))?;
        let coin = &catalog_coin.coin;

        if system.is_on_chain() && !catalog_coin.address_valid(&input.address) {
            return Err(Error::InvalidInput("Invalid destination address".to_string()));
        }

        let amount = precision::quantize_down(parse_strict(&input.amount)?, coin.token_precision);
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidInput("Amount must be positive".to_string()));
        }
        if amount < coin.min_withdraw {
            return Err(Error::InvalidInput(format!(
                "Minimum withdrawal is {} {}",
                coin.min_withdraw, coin.symbol
            )));
        }

        let fee = coin.fee_for(system).ok_or_else(|| {
            Error::InvalidInput(format!("{} cannot be withdrawn through {:?}", coin.symbol, system))
        })?;
        if fee >= amount {
            return Err(Error::InvalidInput("Amount does not cover the withdrawal fee".to_string()));
        }

        let sub = self.subs.resolve(user_id, input.account.as_deref()).await?;
        if !sub.withdrawal_allowed {
            return Err(Error::AccessDenied(
                "Withdrawals are disabled for this sub-account".to_string(),
            ));
        }

        let _admission = self.admission_locks.lock(user_id).await;

        self.check_daily_limit(user_id, &coin.symbol, amount, system).await?;

        let now = Utc::now();
        let mut request = WithdrawRequest {
            id: Uuid::new_v4(),
            user_id,
            sub_account_id: sub.id,
            coin_symbol: coin.symbol.clone(),
            amount,
            fee_amount: fee,
            destination: input.address.trim().to_string(),
            external_system: system,
            status: WithdrawStatus::Pending,
            action_id: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        };

        {
            let _lease = self.leases.acquire(sub.id).await;
            self.funds
                .lock_withdrawal(sub.id, &coin.symbol, amount)
                .await?;
            if let Err(e) = self.repo.insert(&request).await {
                self.funds
                    .release_withdrawal(sub.id, &coin.symbol, amount)
                    .await?;
                return Err(e);
            }
        }

        let summary = [
            ("Amount", format!("{} {}", request.amount, request.coin_symbol)),
            ("Fee", format!("{} {}", request.fee_amount, request.coin_symbol)),
            ("Destination", request.destination.clone()),
            ("Network", format!("{:?}", request.external_system)),
        ];
        let action = self
            .actions
            .create(
                recipient,
                ActionType::Withdraw,
                serde_json::json!({ "withdraw_id": request.id }),
                &summary,
            )
            .await;

        let action = match action {
            Ok(action) => action,
            Err(e) => {
                warn!(withdraw_id = %request.id, "approval emails failed, rolling back: {}", e);
                self.finish_with_release(&mut request, WithdrawStatus::Cancelled)
                    .await?;
                return Err(e);
            }
        };

        request.action_id = Some(action.id);
        request.updated_at = Utc::now();
        self.repo.save(&request).await?;

        self.dirty.mark((user_id, sub.id));
        info!(
            user_id,
            withdraw_id = %request.id,
            action_id = %action.id,
            "Withdrawal of {} {} admitted",
            request.amount,
            request.coin_symbol
        );
        Ok(request)
    }

    async fn check_daily_limit(
        &self,
        user_id: UserId,
        coin: &str,
        amount: Quantity,
        system: ExternalSystem,
    ) -> Result<()> {
        let Some(limit) = self.config.limit_for(system) else {
            return Ok(());
        };

        let since = Utc::now() - Duration::hours(24);
        let mut used = Decimal::ZERO;
        for request in self.repo.list_for_user(user_id).await? {
            if request.external_system != system
                || request.created_at < since
                || !request.status.counts_toward_limit()
            {
                continue;
            }
            used += request.amount * self.btc_rate(&request.coin_symbol).await?;
        }

        let requested = amount * self.btc_rate(coin).await?;
        if used + requested > limit {
            return Err(Error::InvalidInput(format!(
                "Daily withdrawal limit of {} BTC exceeded",
                limit
            )));
        }
        Ok(())
    }

    async fn btc_rate(&self, coin: &str) -> Result<Decimal> {
        self.rates
            .btc_rate(coin)
            .await?
            .ok_or_else(|| Error::InvalidInput(format!("Withdrawals of {} are not available", coin)))
    }

    pub async fn get(&self, id: Uuid) -> Result<WithdrawRequest> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound("Withdrawal not found".to_string()))
    }

    pub async fn list_for_user(&self, user_id: UserId) -> Result<Vec<WithdrawRequest>> {
        self.repo.list_for_user(user_id).await
    }

    pub async fn list_by_status(&self, status: WithdrawStatus) -> Result<Vec<WithdrawRequest>> {
        self.repo.list_by_status(status).await
    }

    /// Both approval keys were presented
    pub async fn on_approved(&self, id: Uuid) -> Result<WithdrawRequest> {
        self.approve_request_at(id, Utc::now()).await
    }

    /// Approve a pending request as of `now` and relay it to custody
    ///
    /// Requests older than the approval window are cancelled and their lock
    /// released. A failed relay leaves the request approved for reprocessing.
    pub async fn approve_request_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<WithdrawRequest> {
        let mut request = self.get(id).await?;
        let window = Duration::minutes(self.config.approval_window_minutes);

        {
            let _lease = self.leases.acquire(request.sub_account_id).await;
            request = self.get(id).await?;
            if request.status != WithdrawStatus::Pending {
                return Err(Error::InvalidInput("Withdrawal is no longer pending".to_string()));
            }

            if now - request.created_at > window {
                self.release_locked(&mut request, WithdrawStatus::Cancelled)
                    .await?;
                info!(withdraw_id = %id, "Withdrawal expired before approval");
                return Err(Error::InvalidInput(
                    "Withdrawal request expired, please create a new one".to_string(),
                ));
            }

            request.status = WithdrawStatus::Approved;
            request.updated_at = Utc::now();
            self.repo.save(&request).await?;
        }
        info!(withdraw_id = %id, "Withdrawal approved");

        self.relay(request).await
    }

    /// Relay an approved request whose earlier relay failed
    pub async fn reprocess(&self, id: Uuid) -> Result<WithdrawRequest> {
        let request = self.get(id).await?;
        if request.status != WithdrawStatus::Approved {
            return Err(Error::InvalidInput("Only approved withdrawals can be reprocessed".to_string()));
        }
        info!(withdraw_id = %id, "Reprocessing withdrawal");
        self.relay(request).await
    }

    async fn relay(&self, mut request: WithdrawRequest) -> Result<WithdrawRequest> {
        let external_id = match self.custody.relay(&request).await {
            Ok(external_id) => external_id,
            Err(e) => {
                error!(withdraw_id = %request.id, "custody relay failed, left approved: {}", e);
                return Ok(request);
            }
        };

        let _lease = self.leases.acquire(request.sub_account_id).await;
        let mut current = self.get(request.id).await?;
        if current.status != WithdrawStatus::Approved {
            // Cancelled by an admin while the relay was in flight
            warn!(withdraw_id = %request.id, status = ?current.status, "relayed withdrawal changed state");
            return Ok(current);
        }
        current.status = WithdrawStatus::Processing;
        current.external_id = Some(external_id);
        current.updated_at = Utc::now();
        self.repo.save(&current).await?;
        request = current;
        info!(withdraw_id = %request.id, "Withdrawal relayed to custody");
        Ok(request)
    }

    /// The owner cancels a request still waiting for approval
    pub async fn cancel(&self, user_id: UserId, id: Uuid) -> Result<WithdrawRequest> {
        let request = self.get(id).await?;
        if request.user_id != user_id {
            return Err(Error::NotFound("Withdrawal not found".to_string()));
        }
        self.cancel_in(id, &[WithdrawStatus::Pending]).await
    }

    /// An admin cancels a pending or approved request
    pub async fn admin_cancel(&self, id: Uuid) -> Result<WithdrawRequest> {
        self.cancel_in(id, &[WithdrawStatus::Pending, WithdrawStatus::Approved])
            .await
    }

    async fn cancel_in(&self, id: Uuid, allowed: &[WithdrawStatus]) -> Result<WithdrawRequest> {
        let sub_account_id = self.get(id).await?.sub_account_id;
        let _lease = self.leases.acquire(sub_account_id).await;
        let mut request = self.get(id).await?;
        if !allowed.contains(&request.status) {
            return Err(Error::InvalidInput("Withdrawal can no longer be cancelled".to_string()));
        }
        self.release_locked(&mut request, WithdrawStatus::Cancelled)
            .await?;
        info!(withdraw_id = %id, "Withdrawal cancelled");
        Ok(request)
    }

    /// Custody reports the final state of a processing request
    pub async fn custody_report(&self, id: Uuid, outcome: CustodyOutcome) -> Result<WithdrawRequest> {
        let sub_account_id = self.get(id).await?.sub_account_id;
        let _lease = self.leases.acquire(sub_account_id).await;
        let mut request = self.get(id).await?;
        if request.status != WithdrawStatus::Processing {
            return Err(Error::InvalidInput("Withdrawal is not processing".to_string()));
        }

        match outcome {
            CustodyOutcome::Completed => {
                self.funds
                    .consume_withdrawal(request.sub_account_id, &request.coin_symbol, request.amount)
                    .await?;
                request.status = WithdrawStatus::Completed;
                request.updated_at = Utc::now();
                self.repo.save(&request).await?;
                self.dirty.mark((request.user_id, request.sub_account_id));
            }
            CustodyOutcome::Failed => {
                self.release_locked(&mut request, WithdrawStatus::Failed)
                    .await?;
            }
        }
        info!(withdraw_id = %id, status = ?request.status, "Custody reported withdrawal");
        Ok(request)
    }

    async fn finish_with_release(
        &self,
        request: &mut WithdrawRequest,
        status: WithdrawStatus,
    ) -> Result<()> {
        let _lease = self.leases.acquire(request.sub_account_id).await;
        self.release_locked(request, status).await
    }

    /// Caller holds the sub-account lease
    async fn release_locked(&self, request: &mut WithdrawRequest, status: WithdrawStatus) -> Result<()> {
        self.funds
            .release_withdrawal(request.sub_account_id, &request.coin_symbol, request.amount)
            .await?;
        request.status = status;
        request.updated_at = Utc::now();
        self.repo.save(request).await?;
        self.dirty.mark((request.user_id, request.sub_account_id));
        debug!(withdraw_id = %request.id, "released {} {}", request.amount, request.coin_symbol);
        Ok(())
    }
}

/// Approval effect of withdraw actions
pub struct WithdrawApproval {
    service: Weak<WithdrawService>,
}

#[async_trait]
impl ActionEffect for WithdrawApproval {
    async fn apply(&self, action: &Action) -> Result<()> {
        let id = action
            .data
            .get("withdraw_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::Internal("withdraw action without a request id".to_string()))?;
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| Error::Internal("withdraw service stopped".to_string()))?;
        service.on_approved(id).await.map(|_| ())
    }
}
