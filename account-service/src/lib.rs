//! Account service: sub-accounts, balance views over the funds engine,
//! per-sub-account leases and the withdrawal state machine

pub mod coins;
pub mod config;
pub mod custody;
pub mod funds;
pub mod lease;
pub mod ledger;
pub mod repository;
pub mod sub_accounts;
pub mod withdraw;

use std::sync::Arc;

use auth_service::actions::ActionService;
use common::cache::DirtyBalances;
use common::db::DbPool;

pub use coins::CoinCatalog;
pub use config::AccountServiceConfig;
pub use custody::{CustodyClient, HttpCustodyClient, MemoryCustodyClient};
pub use funds::{FundsEngine, InMemoryFundsEngine, RateSource, StaticRates};
pub use lease::LeaseManager;
pub use ledger::LedgerService;
pub use repository::{PostgresSubAccountRepository, PostgresWithdrawRepository};
pub use sub_accounts::{InMemorySubAccountRepository, SubAccountRepository, SubAccountService};
pub use withdraw::{
    CustodyOutcome, InMemoryWithdrawRepository, WithdrawInput, WithdrawRepository, WithdrawService,
};

/// Repository type
pub enum RepositoryType {
    /// In-memory repositories
    InMemory,
    /// PostgreSQL repositories on a shared pool
    Postgres(DbPool),
}

/// Collaborators outside the account service
pub struct AccountCollaborators {
    pub funds: Arc<dyn FundsEngine>,
    pub rates: Arc<dyn RateSource>,
    pub custody: Arc<dyn CustodyClient>,
    pub coins: Arc<CoinCatalog>,
}

impl AccountCollaborators {
    /// In-memory funds engine and custody with the default coins
    pub fn in_memory() -> Self {
        Self {
            funds: Arc::new(InMemoryFundsEngine::new()),
            rates: Arc::new(StaticRates::new()),
            custody: Arc::new(MemoryCustodyClient::new()),
            coins: Arc::new(CoinCatalog::with_defaults()),
        }
    }
}

/// Every account component, wired together
pub struct AccountModule {
    pub config: Arc<AccountServiceConfig>,
    pub sub_accounts: Arc<SubAccountService>,
    pub ledger: Arc<LedgerService>,
    pub withdrawals: Arc<WithdrawService>,
    pub leases: Arc<LeaseManager>,
    pub funds: Arc<dyn FundsEngine>,
    pub rates: Arc<dyn RateSource>,
    pub coins: Arc<CoinCatalog>,
}

impl AccountModule {
    /// Wire the module and register the withdraw approval effect on `actions`
    pub fn build(
        config: AccountServiceConfig,
        repository: RepositoryType,
        collaborators: AccountCollaborators,
        actions: Arc<ActionService>,
        dirty: Arc<DirtyBalances>,
    ) -> Self {
        let config = Arc::new(config);
        let (sub_repo, withdraw_repo): (Arc<dyn SubAccountRepository>, Arc<dyn WithdrawRepository>) =
            match repository {
                RepositoryType::InMemory => (
                    Arc::new(InMemorySubAccountRepository::new()),
                    Arc::new(InMemoryWithdrawRepository::new()),
                ),
                RepositoryType::Postgres(pool) => (
                    Arc::new(PostgresSubAccountRepository::new(pool.clone())),
                    Arc::new(PostgresWithdrawRepository::new(pool)),
                ),
            };

        let leases = Arc::new(LeaseManager::new());
        let sub_accounts = Arc::new(SubAccountService::new(sub_repo, config.max_user_sub_accounts));
        let ledger = Arc::new(LedgerService::new(
            sub_accounts.clone(),
            collaborators.funds.clone(),
            collaborators.rates.clone(),
            leases.clone(),
            dirty.clone(),
        ));
        let withdrawals = Arc::new(WithdrawService::new(
            config.clone(),
            collaborators.coins.clone(),
            sub_accounts.clone(),
            collaborators.funds.clone(),
            collaborators.rates.clone(),
            leases.clone(),
            dirty,
            withdraw_repo,
            actions,
            collaborators.custody,
        ));
        withdrawals.register_effect();

        Self {
            config,
            sub_accounts,
            ledger,
            withdrawals,
            leases,
            funds: collaborators.funds,
            rates: collaborators.rates,
            coins: collaborators.coins,
        }
    }
}
