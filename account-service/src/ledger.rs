//! Sub-account ledger
//!
//! Balance reads with BTC valuation, inter-sub-account transfers and
//! deposits. Every write runs under the sub-account lease and marks the
//! (user, sub-account) dirty for the balance publisher.

use std::sync::Arc;

use common::cache::DirtyBalances;
use common::decimal::{parse_strict, Decimal};
use common::error::{Error, Result};
use common::model::balance::{BalanceEntry, Balances};
use common::model::{SubAccountId, UserId};
use tracing::{debug, info};

use crate::funds::{FundsEngine, RateSource};
use crate::lease::LeaseManager;
use crate::sub_accounts::SubAccountService;

/// Balance views and transfers over the funds engine
pub struct LedgerService {
    subs: Arc<SubAccountService>,
    funds: Arc<dyn FundsEngine>,
    rates: Arc<dyn RateSource>,
    leases: Arc<LeaseManager>,
    dirty: Arc<DirtyBalances>,
}

impl LedgerService {
    pub fn new(
        subs: Arc<SubAccountService>,
        funds: Arc<dyn FundsEngine>,
        rates: Arc<dyn RateSource>,
        leases: Arc<LeaseManager>,
        dirty: Arc<DirtyBalances>,
    ) -> Self {
        Self {
            subs,
            funds,
            rates,
            leases,
            dirty,
        }
    }

    pub fn dirty(&self) -> &Arc<DirtyBalances> {
        &self.dirty
    }

    /// Balances of the sub-account selected by an account-group string
    pub async fn balances(&self, user_id: UserId, selector: Option<&str>) -> Result<Balances> {
        let sub = self.subs.resolve(user_id, selector).await?;
        self.balances_for(user_id, sub.id).await
    }

    /// Balances of a sub-account the caller already resolved
    pub async fn balances_for(&self, user_id: UserId, sub_account_id: SubAccountId) -> Result<Balances> {
        let mut entries = self.funds.balances(sub_account_id).await?;
        for entry in entries.iter_mut() {
            self.value_entry(entry).await?;
        }
        Ok(Balances {
            user_id,
            sub_account_id,
            entries,
        })
    }

    /// Balances of a sub-account, provided the user owns it
    pub async fn owned_balances(&self, user_id: UserId, sub_account_id: SubAccountId) -> Result<Balances> {
        let sub = self.subs.get_owned(user_id, sub_account_id).await?;
        self.balances_for(user_id, sub.id).await
    }

    /// Balances of every sub-account of the user
    pub async fn all_balances(&self, user_id: UserId) -> Result<Vec<Balances>> {
        let mut all = Vec::new();
        for sub in self.subs.list(user_id).await? {
            all.push(self.balances_for(user_id, sub.id).await?);
        }
        Ok(all)
    }

    /// One coin of a sub-account
    pub async fn balance(&self, sub_account_id: SubAccountId, coin: &str) -> Result<BalanceEntry> {
        let mut entry = self.funds.balance(sub_account_id, coin).await?;
        self.value_entry(&mut entry).await?;
        Ok(entry)
    }

    async fn value_entry(&self, entry: &mut BalanceEntry) -> Result<()> {
        // Coins without a rate are valued at zero
        let rate = self.rates.btc_rate(&entry.coin).await?.unwrap_or(Decimal::ZERO);
        entry.btc_value = entry.total() * rate;
        Ok(())
    }

    /// Move available funds between two of the user's sub-accounts
    pub async fn transfer(
        &self,
        user_id: UserId,
        from: &str,
        to: &str,
        coin: &str,
        amount: &str,
    ) -> Result<()> {
        let amount = parse_strict(amount)?;
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidInput("Amount must be positive".to_string()));
        }
        let source = self.subs.resolve(user_id, Some(from)).await?;
        let target = self.subs.resolve(user_id, Some(to)).await?;
        if source.id == target.id {
            return Err(Error::InvalidInput("Cannot transfer to the same sub-account".to_string()));
        }
        if !source.transfer_allowed || !target.transfer_allowed {
            return Err(Error::AccessDenied("Transfers are disabled for this sub-account".to_string()));
        }

        {
            let _pair = self.leases.acquire_pair(source.id, target.id).await;
            let entry = self.funds.balance(source.id, coin).await?;
            if entry.available < amount {
                return Err(Error::InvalidInput("Insufficient balance".to_string()));
            }
            self.funds.transfer(source.id, target.id, coin, amount).await?;
        }

        self.dirty.mark((user_id, source.id));
        self.dirty.mark((user_id, target.id));
        info!(
            user_id,
            from = source.id,
            to = target.id,
            "Transferred {} {}",
            amount,
            coin
        );
        Ok(())
    }

    /// Credit a sub-account; used by deposit notifications and demo seeding
    pub async fn deposit(
        &self,
        user_id: UserId,
        sub_account_id: SubAccountId,
        coin: &str,
        amount: Decimal,
    ) -> Result<()> {
        {
            let _lease = self.leases.acquire(sub_account_id).await;
            self.funds.deposit(sub_account_id, coin, amount).await?;
        }
        self.dirty.mark((user_id, sub_account_id));
        debug!(user_id, sub_account_id, "Deposited {} {}", amount, coin);
        Ok(())
    }
}
