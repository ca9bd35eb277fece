use std::sync::Arc;

use account_service::{
    FundsEngine, InMemoryFundsEngine, InMemorySubAccountRepository, LeaseManager, LedgerService,
    StaticRates, SubAccountService,
};
use account_service::sub_accounts::SubAccountUpdate;
use common::cache::DirtyBalances;
use common::decimal::dec;
use common::ErrorKind;

struct Ledger {
    ledger: Arc<LedgerService>,
    subs: Arc<SubAccountService>,
    funds: Arc<InMemoryFundsEngine>,
    dirty: Arc<DirtyBalances>,
}

fn ledger() -> Ledger {
    let subs = Arc::new(SubAccountService::new(
        Arc::new(InMemorySubAccountRepository::new()),
        3,
    ));
    let funds = Arc::new(InMemoryFundsEngine::new());
    let rates = Arc::new(StaticRates::new());
    rates.set("usdt", dec!(0.00002));
    let dirty = Arc::new(DirtyBalances::new());
    let ledger = Arc::new(LedgerService::new(
        subs.clone(),
        funds.clone(),
        rates,
        Arc::new(LeaseManager::new()),
        dirty.clone(),
    ));
    Ledger {
        ledger,
        subs,
        funds,
        dirty,
    }
}

#[tokio::test]
async fn balances_carry_btc_value() {
    let l = ledger();
    let defaults = l.subs.create_defaults(1).await.unwrap();
    l.ledger.deposit(1, defaults[0].id, "btc", dec!(0.5)).await.unwrap();
    l.ledger.deposit(1, defaults[0].id, "usdt", dec!(1000)).await.unwrap();
    l.ledger.deposit(1, defaults[0].id, "xyz", dec!(3)).await.unwrap();

    let balances = l.ledger.balances(1, Some("main")).await.unwrap();
    assert_eq!(balances.sub_account_id, defaults[0].id);
    assert_eq!(balances.get("btc").btc_value, dec!(0.5));
    assert_eq!(balances.get("usdt").btc_value, dec!(0.02));
    // No rate, no value
    assert_eq!(balances.get("xyz").btc_value, dec!(0));
    assert_eq!(balances.total_btc(), dec!(0.52));

    let err = l.ledger.balances(1, Some("missing")).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid account");
}

#[tokio::test]
async fn transfer_between_sub_accounts() {
    let l = ledger();
    let defaults = l.subs.create_defaults(1).await.unwrap();
    let (main, first) = (defaults[0].id, defaults[1].id);
    l.ledger.deposit(1, main, "btc", dec!(1)).await.unwrap();
    l.dirty.drain();

    l.ledger
        .transfer(1, "main", "first", "btc", "0.25")
        .await
        .unwrap();
    assert_eq!(l.funds.balance(main, "btc").await.unwrap().available, dec!(0.75));
    assert_eq!(l.funds.balance(first, "btc").await.unwrap().available, dec!(0.25));

    let dirty = l.dirty.drain();
    assert!(dirty.contains(&(1, main)));
    assert!(dirty.contains(&(1, first)));

    let err = l
        .ledger
        .transfer(1, "first", "main", "btc", "1")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Insufficient balance");
    assert!(l.ledger.transfer(1, "main", "main", "btc", "0.1").await.is_err());
    assert!(l.ledger.transfer(1, "main", "first", "btc", "1e2").await.is_err());
}

#[tokio::test]
async fn transfer_respects_flags() {
    let l = ledger();
    let defaults = l.subs.create_defaults(1).await.unwrap();
    l.ledger.deposit(1, defaults[0].id, "btc", dec!(1)).await.unwrap();
    l.subs
        .update(
            1,
            defaults[1].id,
            SubAccountUpdate {
                transfer_allowed: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = l
        .ledger
        .transfer(1, "main", "first", "btc", "0.1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[tokio::test]
async fn concurrent_opposite_transfers_keep_the_total() {
    let l = ledger();
    let defaults = l.subs.create_defaults(1).await.unwrap();
    let (main, first) = (defaults[0].id, defaults[1].id);
    l.ledger.deposit(1, main, "btc", dec!(10)).await.unwrap();
    l.ledger.deposit(1, first, "btc", dec!(10)).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..40 {
        let ledger = l.ledger.clone();
        tasks.push(tokio::spawn(async move {
            let (from, to) = if i % 2 == 0 { ("main", "first") } else { ("first", "main") };
            ledger.transfer(1, from, to, "btc", "0.1").await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let a = l.funds.balance(main, "btc").await.unwrap().available;
    let b = l.funds.balance(first, "btc").await.unwrap().available;
    assert_eq!(a + b, dec!(20));
    assert_eq!(a, dec!(10));
}
