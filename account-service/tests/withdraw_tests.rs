use std::sync::Arc;

use account_service::withdraw::WithdrawInput;
use account_service::{
    AccountCollaborators, AccountModule, AccountServiceConfig, CoinCatalog, CustodyOutcome,
    FundsEngine, InMemoryFundsEngine, MemoryCustodyClient, RepositoryType, StaticRates,
};
use auth_service::actions::{key_from_email, ActionService, InMemoryActionRepository, Recipient};
use chrono::Duration;
use common::cache::DirtyBalances;
use common::decimal::dec;
use common::mail::{MailDispatcher, MemoryMailer};
use common::model::withdraw::{ExternalSystem, WithdrawStatus};
use common::ErrorKind;

const BTC_ADDRESS: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

struct Harness {
    module: AccountModule,
    actions: Arc<ActionService>,
    mailer: Arc<MemoryMailer>,
    custody: Arc<MemoryCustodyClient>,
    funds: Arc<InMemoryFundsEngine>,
    dirty: Arc<DirtyBalances>,
    main_id: i64,
}

fn recipient() -> Recipient {
    Recipient {
        user_id: 1,
        email: "alice@example.com".to_string(),
        anti_phishing_code: None,
    }
}

fn btc_withdrawal(amount: &str) -> WithdrawInput {
    WithdrawInput {
        account: None,
        coin: "btc".to_string(),
        amount: amount.to_string(),
        address: BTC_ADDRESS.to_string(),
        external_system: ExternalSystem::InternalCustody,
    }
}

async fn harness() -> Harness {
    let mailer = Arc::new(MemoryMailer::new());
    let actions = Arc::new(ActionService::new(
        Arc::new(InMemoryActionRepository::new()),
        MailDispatcher::spawn(mailer.clone(), 1, 16),
        "http://localhost:8080",
    ));
    let funds = Arc::new(InMemoryFundsEngine::new());
    let custody = Arc::new(MemoryCustodyClient::new());
    let rates = Arc::new(StaticRates::new());
    rates.set("usdt", dec!(0.00002));
    let dirty = Arc::new(DirtyBalances::new());

    let module = AccountModule::build(
        AccountServiceConfig::default(),
        RepositoryType::InMemory,
        AccountCollaborators {
            funds: funds.clone(),
            rates,
            custody: custody.clone(),
            coins: Arc::new(CoinCatalog::with_defaults()),
        },
        actions.clone(),
        dirty.clone(),
    );

    let defaults = module.sub_accounts.create_defaults(1).await.unwrap();
    let main_id = defaults[0].id;
    funds.deposit(main_id, "btc", dec!(1.0)).await.unwrap();

    Harness {
        module,
        actions,
        mailer,
        custody,
        funds,
        dirty,
        main_id,
    }
}

fn approval_keys(mailer: &MemoryMailer) -> (String, String) {
    let mails = mailer.sent_to("alice@example.com");
    let n = mails.len();
    assert!(n >= 2);
    (
        key_from_email(&mails[n - 2].body).unwrap(),
        key_from_email(&mails[n - 1].body).unwrap(),
    )
}

#[tokio::test]
async fn admission_locks_the_gross_amount() {
    let h = harness().await;

    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();
    assert_eq!(request.status, WithdrawStatus::Pending);
    assert_eq!(request.amount, dec!(0.5));
    assert_eq!(request.fee_amount, dec!(0.0005));
    assert_eq!(request.net_amount(), dec!(0.4995));
    assert!(request.action_id.is_some());

    let balance = h.funds.balance(h.main_id, "btc").await.unwrap();
    assert_eq!(balance.available, dec!(0.5));
    assert_eq!(balance.in_withdrawals, dec!(0.5));
    assert_eq!(balance.total(), dec!(1.0));
    assert!(h.dirty.drain().contains(&(1, h.main_id)));

    // Both emails carry the summary
    let mails = h.mailer.sent_to("alice@example.com");
    assert_eq!(mails.len(), 2);
    assert!(mails[0].body.contains(BTC_ADDRESS));
}

#[tokio::test]
async fn approval_relays_exactly_once() {
    let h = harness().await;
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();
    let action_id = request.action_id.unwrap();
    let (key_a, key_b) = approval_keys(&h.mailer);

    h.actions.approve(action_id, &key_b).await.unwrap();
    assert!(h.custody.relayed().is_empty());
    h.actions.approve(action_id, &key_a).await.unwrap();
    h.actions.approve(action_id, &key_a).await.unwrap();

    assert_eq!(h.custody.relayed().len(), 1);
    let stored = h.module.withdrawals.get(request.id).await.unwrap();
    assert_eq!(stored.status, WithdrawStatus::Processing);
    assert_eq!(stored.external_id.as_deref(), Some("mem-1"));

    let done = h
        .module
        .withdrawals
        .custody_report(request.id, CustodyOutcome::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, WithdrawStatus::Completed);
    let balance = h.funds.balance(h.main_id, "btc").await.unwrap();
    assert_eq!(balance.available, dec!(0.5));
    assert_eq!(balance.in_withdrawals, dec!(0));
}

#[tokio::test]
async fn cancel_restores_the_balance() {
    let h = harness().await;
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.3"))
        .await
        .unwrap();

    let err = h.module.withdrawals.cancel(2, request.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let cancelled = h.module.withdrawals.cancel(1, request.id).await.unwrap();
    assert_eq!(cancelled.status, WithdrawStatus::Cancelled);
    let balance = h.funds.balance(h.main_id, "btc").await.unwrap();
    assert_eq!(balance.available, dec!(1.0));
    assert_eq!(balance.in_withdrawals, dec!(0));

    // A cancelled request cannot be approved afterwards
    let (key_a, key_b) = approval_keys(&h.mailer);
    let action_id = request.action_id.unwrap();
    h.actions.approve(action_id, &key_a).await.unwrap();
    assert!(h.actions.approve(action_id, &key_b).await.is_err());
    assert!(h.custody.relayed().is_empty());
}

#[tokio::test]
async fn email_failure_rolls_back_the_lock() {
    let h = harness().await;
    h.mailer.set_failing(true);

    let err = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);

    let balance = h.funds.balance(h.main_id, "btc").await.unwrap();
    assert_eq!(balance.available, dec!(1.0));
    assert_eq!(balance.in_withdrawals, dec!(0));
    let requests = h.module.withdrawals.list_for_user(1).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, WithdrawStatus::Cancelled);
}

#[tokio::test]
async fn stale_requests_expire() {
    let h = harness().await;
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();

    let later = request.created_at + Duration::minutes(61);
    let err = h
        .module
        .withdrawals
        .approve_request_at(request.id, later)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expired"));

    let stored = h.module.withdrawals.get(request.id).await.unwrap();
    assert_eq!(stored.status, WithdrawStatus::Cancelled);
    assert_eq!(h.funds.balance(h.main_id, "btc").await.unwrap().available, dec!(1.0));
    assert!(h.custody.relayed().is_empty());
}

#[tokio::test]
async fn fresh_requests_are_not_expired() {
    let h = harness().await;
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();

    let within = request.created_at + Duration::minutes(59);
    let approved = h
        .module
        .withdrawals
        .approve_request_at(request.id, within)
        .await
        .unwrap();
    assert_eq!(approved.status, WithdrawStatus::Processing);
}

#[tokio::test]
async fn failed_relay_stays_approved_until_reprocessed() {
    let h = harness().await;
    h.custody.set_failing(true);
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();

    let approved = h.module.withdrawals.on_approved(request.id).await.unwrap();
    assert_eq!(approved.status, WithdrawStatus::Approved);
    let listed = h
        .module
        .withdrawals
        .list_by_status(WithdrawStatus::Approved)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    h.custody.set_failing(false);
    let processing = h.module.withdrawals.reprocess(request.id).await.unwrap();
    assert_eq!(processing.status, WithdrawStatus::Processing);
    assert!(h.module.withdrawals.reprocess(request.id).await.is_err());

    let failed = h
        .module
        .withdrawals
        .custody_report(request.id, CustodyOutcome::Failed)
        .await
        .unwrap();
    assert_eq!(failed.status, WithdrawStatus::Failed);
    assert_eq!(h.funds.balance(h.main_id, "btc").await.unwrap().available, dec!(1.0));
}

#[tokio::test]
async fn admin_cancels_approved_requests() {
    let h = harness().await;
    h.custody.set_failing(true);
    let request = h
        .module
        .withdrawals
        .admit(&recipient(), btc_withdrawal("0.5"))
        .await
        .unwrap();
    h.module.withdrawals.on_approved(request.id).await.unwrap();

    // The owner can only cancel pending requests
    assert!(h.module.withdrawals.cancel(1, request.id).await.is_err());
    let cancelled = h.module.withdrawals.admin_cancel(request.id).await.unwrap();
    assert_eq!(cancelled.status, WithdrawStatus::Cancelled);
    assert_eq!(h.funds.balance(h.main_id, "btc").await.unwrap().available, dec!(1.0));
}

#[tokio::test]
async fn admission_validation() {
    let h = harness().await;
    let withdrawals = &h.module.withdrawals;

    let mut unknown = btc_withdrawal("0.5");
    unknown.coin = "doge".to_string();
    assert!(withdrawals.admit(&recipient(), unknown).await.is_err());

    let mut bad_address = btc_withdrawal("0.5");
    bad_address.address = "not-an-address".to_string();
    let err = withdrawals.admit(&recipient(), bad_address).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid destination address");

    // Fiat rails skip address validation
    let mut fiat = btc_withdrawal("0.01");
    fiat.address = "IBAN DE89 3704 0044 0532 0130 00".to_string();
    fiat.external_system = ExternalSystem::ProviderA;
    withdrawals.admit(&recipient(), fiat).await.unwrap();

    assert!(withdrawals.admit(&recipient(), btc_withdrawal("-1")).await.is_err());
    assert!(withdrawals.admit(&recipient(), btc_withdrawal("0.0005")).await.is_err());
    assert!(withdrawals.admit(&recipient(), btc_withdrawal("5")).await.is_err());

    // Quantized toward zero at the coin precision
    let request = withdrawals
        .admit(&recipient(), btc_withdrawal("0.123456789"))
        .await
        .unwrap();
    assert_eq!(request.amount, dec!(0.12345678));

    let mut wrong_account = btc_withdrawal("0.1");
    wrong_account.account = Some("savings".to_string());
    let err = withdrawals.admit(&recipient(), wrong_account).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid account");
}

#[tokio::test]
async fn daily_limit_is_per_external_system() {
    let h = harness().await;
    h.funds.deposit(h.main_id, "btc", dec!(4.0)).await.unwrap();
    let withdrawals = &h.module.withdrawals;

    // Custody limit is 2 BTC per 24h by default
    withdrawals.admit(&recipient(), btc_withdrawal("1.5")).await.unwrap();
    let err = withdrawals
        .admit(&recipient(), btc_withdrawal("0.6"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("limit"));

    let mut fiat = btc_withdrawal("0.6");
    fiat.external_system = ExternalSystem::ProviderB;
    withdrawals.admit(&recipient(), fiat).await.unwrap();

    // Cancelled requests free the limit
    let pending = withdrawals.list_by_status(WithdrawStatus::Pending).await.unwrap();
    withdrawals.cancel(1, pending[0].id).await.unwrap();
    withdrawals.admit(&recipient(), btc_withdrawal("0.6")).await.unwrap();
}
