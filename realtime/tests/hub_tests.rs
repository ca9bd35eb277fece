use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use account_service::{
    InMemoryFundsEngine, InMemorySubAccountRepository, LeaseManager, LedgerService, RateSource,
    StaticRates, SubAccountService,
};
use async_trait::async_trait;
use auth_service::{AuthConfig, TokenService};
use common::cache::{ActivityTracker, DirtyBalances};
use common::decimal::{dec, Decimal};
use common::features::StaticFeatureFlags;
use common::error::{Error, Result};
use common::model::balance::Balances;
use common::model::order::{OrderType, Side, StopKind, UiSource};
use common::model::UserId;
use common::ErrorKind;
use order_service::{InMemoryOrderEngine, NewOrder, OrderEngine, OrderUpdateCache};
use realtime::{
    spawn_all, ActivityPruner, BalanceCoalescer, CoinsValuePoller, EngineMarketStats, Hub,
    MarketStats, MarketSummary, NewNotification, NotificationCenter, OrderUpdateCoalescer,
    Periodic, SubscriberAuth, TickerPoller,
};
use tokio::sync::mpsc::error::TryRecvError;

/// Tokens of the form `token-<user id>`
struct FakeAuth;

impl SubscriberAuth for FakeAuth {
    fn authenticate(&self, token: &str, _ip: &str) -> Result<UserId> {
        token
            .strip_prefix("token-")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| Error::Unauthorized("Invalid token".to_string()))
    }
}

struct Fixture {
    hub: Arc<Hub>,
    ledger: Arc<LedgerService>,
    subs: Arc<SubAccountService>,
    dirty: Arc<DirtyBalances>,
}

async fn fixture(lifetime: chrono::Duration) -> Fixture {
    let subs = Arc::new(SubAccountService::new(
        Arc::new(InMemorySubAccountRepository::new()),
        3,
    ));
    subs.create_defaults(7).await.unwrap();
    subs.create_defaults(9).await.unwrap();
    let dirty = Arc::new(DirtyBalances::new());
    let ledger = Arc::new(LedgerService::new(
        subs.clone(),
        Arc::new(InMemoryFundsEngine::new()),
        Arc::new(StaticRates::new()),
        Arc::new(LeaseManager::new()),
        dirty.clone(),
    ));
    let hub = Arc::new(Hub::new(Arc::new(FakeAuth), ledger.clone(), lifetime, 16));
    Fixture {
        hub,
        ledger,
        subs,
        dirty,
    }
}

fn order(owner_id: UserId, sub_account_id: i64, side: Side, price: &str) -> NewOrder {
    NewOrder {
        owner_id,
        sub_account_id,
        market_id: "btcusdt".to_string(),
        order_type: OrderType::Limit,
        side,
        amount: dec!(1),
        price: price.parse().unwrap(),
        stop: StopKind::None,
        stop_price: dec!(0),
        take_profit_price: None,
        stop_loss_price: None,
        trailing_stop: None,
        parent_order_id: None,
        ui: UiSource::Web,
        client_order_id: None,
    }
}

#[tokio::test]
async fn foreign_user_channel_is_refused_without_snapshot() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let (id, mut rx) = f.hub.connect();

    let err = f
        .hub
        .subscribe(id, "user:balances#9", Some("token-7"), "127.0.0.1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert!(!f.hub.has_subscribers(&"user:balances#9".parse().unwrap()));

    // Someone else's sub-account behind your own user id
    let other = f.subs.list(9).await.unwrap()[0].id;
    let channel = format!("user:balances#7#{}", other);
    assert!(f
        .hub
        .subscribe(id, &channel, Some("token-7"), "127.0.0.1")
        .await
        .is_err());
    assert!(!f.hub.has_subscribers(&channel.parse().unwrap()));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn user_channels_need_a_token() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let (id, _rx) = f.hub.connect();
    let err = f
        .hub
        .subscribe(id, "user:orders#7", None, "127.0.0.1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    f.hub
        .subscribe(id, "public:trades/btcusdt", None, "127.0.0.1")
        .await
        .unwrap();
}

#[tokio::test]
async fn balance_subscription_sends_a_snapshot() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let main = f.subs.list(7).await.unwrap()[0].id;
    f.ledger.deposit(7, main, "btc", dec!(1)).await.unwrap();

    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, &format!("user:balances#7#{}", main), Some("token-7"), "127.0.0.1")
        .await
        .unwrap();
    let push = rx.try_recv().unwrap();
    let balances: Balances = serde_json::from_value(push.data).unwrap();
    assert_eq!(balances.get("btc").available, dec!(1));
    assert!(rx.try_recv().is_err());

    // Without a sub-account, one snapshot per sub-account
    f.hub
        .subscribe(id, "user:balances#7", Some("token-7"), "127.0.0.1")
        .await
        .unwrap();
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());

    // Other kinds get no snapshot
    f.hub
        .subscribe(id, "user:notifications#7", Some("token-7"), "127.0.0.1")
        .await
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn dirty_marks_coalesce_into_one_publish() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let main = f.subs.list(7).await.unwrap()[0].id;
    let channel = format!("user:balances#7#{}", main);
    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, &channel, Some("token-7"), "127.0.0.1")
        .await
        .unwrap();
    rx.try_recv().unwrap();

    f.ledger.deposit(7, main, "btc", dec!(1)).await.unwrap();
    f.ledger.deposit(7, main, "btc", dec!(2)).await.unwrap();
    let coalescer = BalanceCoalescer::new(f.dirty.clone(), f.ledger.clone(), f.hub.clone());
    coalescer.tick().await.unwrap();

    let push = rx.try_recv().unwrap();
    assert_eq!(push.channel, channel);
    let balances: Balances = serde_json::from_value(push.data).unwrap();
    assert_eq!(balances.get("btc").available, dec!(3));
    assert!(rx.try_recv().is_err());

    coalescer.tick().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn order_updates_reach_subscribers_only() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let engine = Arc::new(InMemoryOrderEngine::new());
    engine.register_market("btcusdt");
    let updates = Arc::new(OrderUpdateCache::new());
    engine.subscribe(updates.clone());

    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "user:order-update#7", Some("token-7"), "127.0.0.1")
        .await
        .unwrap();

    let sub7 = f.subs.list(7).await.unwrap()[0].id;
    let sub9 = f.subs.list(9).await.unwrap()[0].id;
    engine.submit(order(7, sub7, Side::Buy, "100")).await.unwrap();
    engine.submit(order(9, sub9, Side::Buy, "99")).await.unwrap();

    let coalescer = OrderUpdateCoalescer::new(updates.clone(), f.hub.clone());
    coalescer.tick().await.unwrap();

    let push = rx.try_recv().unwrap();
    assert_eq!(push.channel, "user:order-update#7");
    assert_eq!(push.data.as_array().map(|a| a.len()), Some(1));
    assert!(updates.drain_user(9).is_empty());
}

#[tokio::test]
async fn unrenewed_subscriptions_expire() {
    let f = fixture(chrono::Duration::zero()).await;
    let (id, _rx) = f.hub.connect();
    f.hub
        .subscribe(id, "public:coins-value", None, "127.0.0.1")
        .await
        .unwrap();
    let activity = Arc::new(ActivityTracker::new());
    activity.touch_at(7, chrono::Utc::now() - chrono::Duration::seconds(20));

    ActivityPruner::new(activity.clone(), f.hub.clone(), Duration::from_secs(15))
        .tick()
        .await
        .unwrap();
    assert!(!f.hub.has_subscribers(&"public:coins-value".parse().unwrap()));
    assert!(!activity.is_online(7));
}

#[tokio::test]
async fn activity_tick_prunes_expired_sessions() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let tokens = Arc::new(TokenService::new(
        Arc::new(AuthConfig::with_secrets("session-secret", "preauth-secret")),
        Arc::new(StaticFeatureFlags::new()),
    ));
    let now = chrono::Utc::now();
    tokens.sessions().insert("stale", 7, now - chrono::Duration::minutes(1));
    tokens.sessions().insert("live", 7, now + chrono::Duration::minutes(5));
    tokens.sessions().insert("other", 9, now - chrono::Duration::minutes(1));

    ActivityPruner::new(Arc::new(ActivityTracker::new()), f.hub.clone(), Duration::from_secs(15))
        .with_sessions(tokens.clone())
        .tick()
        .await
        .unwrap();
    assert_eq!(tokens.sessions().count_for_user(7), 1);
    assert_eq!(tokens.sessions().count_for_user(9), 0);
    assert!(tokens.sessions().is_live("live", chrono::Utc::now()));
}

#[tokio::test]
async fn notifications_carry_the_unread_count() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let center = Arc::new(NotificationCenter::new(f.hub.clone()));
    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "user:notifications#7", Some("token-7"), "127.0.0.1")
        .await
        .unwrap();

    let first = center.notify(NewNotification::new(7, "Withdrawal", "approved"));
    let dispatcher = center.dispatcher(1, 4);
    dispatcher
        .submit_and_wait(NewNotification::new(7, "Withdrawal", "completed"))
        .await
        .unwrap();

    rx.try_recv().unwrap();
    let push = rx.try_recv().unwrap();
    assert_eq!(push.data["unread"], 2);
    assert_eq!(center.unread_count(7), 2);

    center.mark_read(7, first.id).unwrap();
    assert_eq!(center.unread_count(7), 1);
    assert!(center.mark_read(9, first.id).is_err());
    assert_eq!(center.mark_all_read(7), 1);

    let (page, total) = center.list(7, 1, 1);
    assert_eq!(total, 2);
    assert_eq!(page[0].body, "completed");
}

#[tokio::test]
async fn ticker_carries_the_volume_change() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let engine = Arc::new(InMemoryOrderEngine::new());
    engine.register_market("btcusdt");
    let markets = Arc::new(order_service::MarketCatalog::new());
    markets.insert(common::model::market::Market {
        id: "btcusdt".to_string(),
        base_coin: "btc".to_string(),
        quote_coin: "usdt".to_string(),
        price_precision: 2,
        amount_precision: 6,
        min_amount: dec!(0.0001),
        active: true,
    });
    engine.submit(order(7, 1, Side::Sell, "100")).await.unwrap();
    engine.submit(order(9, 3, Side::Buy, "100")).await.unwrap();

    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "public:market/24h_tick", None, "127.0.0.1")
        .await
        .unwrap();
    let stats = Arc::new(EngineMarketStats::new(engine, markets));
    TickerPoller::new(stats, f.hub.clone()).tick().await.unwrap();

    let push = rx.try_recv().unwrap();
    assert_eq!(push.data["market_id"], "btcusdt");
    assert!(push.data["quote_volume_change"].is_null());
    assert_eq!(push.data["volume"], "1");
}

/// Statistics that fail while `down` is set
struct FlakyStats {
    down: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyStats {
    fn new(down: bool) -> Arc<Self> {
        Arc::new(Self {
            down: AtomicBool::new(down),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MarketStats for FlakyStats {
    async fn summaries(&self) -> Result<Vec<MarketSummary>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Upstream("stats store unreachable".to_string()));
        }
        Ok(vec![MarketSummary {
            market_id: "btcusdt".to_string(),
            last_price: dec!(100),
            high: dec!(110),
            low: dec!(90),
            volume: dec!(2),
            quote_volume: dec!(200),
            previous_quote_volume: dec!(100),
        }])
    }
}

/// Rates that fail while `down` is set
struct FlakyRates {
    down: AtomicBool,
}

#[async_trait]
impl RateSource for FlakyRates {
    async fn btc_rate(&self, _coin: &str) -> Result<Option<Decimal>> {
        Ok(None)
    }

    async fn all_rates(&self) -> Result<HashMap<String, Decimal>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Upstream("rate feed unreachable".to_string()));
        }
        Ok(HashMap::from([("eth".to_string(), dec!(0.05))]))
    }
}

#[tokio::test]
async fn ticker_skips_a_tick_when_stats_fail() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "public:market/24h_tick", None, "127.0.0.1")
        .await
        .unwrap();
    let stats = FlakyStats::new(true);
    let poller = TickerPoller::new(stats.clone(), f.hub.clone());

    poller.tick().await.unwrap();
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    stats.down.store(false, Ordering::SeqCst);
    poller.tick().await.unwrap();
    let push = rx.try_recv().unwrap();
    assert_eq!(push.data["market_id"], "btcusdt");
    let change: Decimal = push.data["quote_volume_change"].as_str().unwrap().parse().unwrap();
    assert_eq!(change, dec!(100));
}

#[tokio::test]
async fn coins_value_skips_a_tick_when_rates_fail() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "public:coins-value", None, "127.0.0.1")
        .await
        .unwrap();
    let rates = Arc::new(FlakyRates {
        down: AtomicBool::new(true),
    });
    let poller = CoinsValuePoller::new(rates.clone(), f.hub.clone());

    poller.tick().await.unwrap();
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    rates.down.store(false, Ordering::SeqCst);
    poller.tick().await.unwrap();
    let push = rx.try_recv().unwrap();
    let eth: Decimal = push.data["btc"]["eth"].as_str().unwrap().parse().unwrap();
    assert_eq!(eth, dec!(0.05));
}

#[tokio::test]
async fn dispatcher_outlives_upstream_outages() {
    let f = fixture(chrono::Duration::hours(24)).await;
    let (id, mut rx) = f.hub.connect();
    f.hub
        .subscribe(id, "public:market/24h_tick", None, "127.0.0.1")
        .await
        .unwrap();
    let stats = FlakyStats::new(true);
    let job: Arc<dyn Periodic> = Arc::new(TickerPoller::new(stats.clone(), f.hub.clone()));
    let handle = spawn_all(vec![(job, Duration::from_millis(10))]);

    tokio::time::sleep(Duration::from_millis(35)).await;
    assert!(stats.calls.load(Ordering::SeqCst) >= 2);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    stats.down.store(false, Ordering::SeqCst);
    let push = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("ticker resumed")
        .unwrap();
    assert_eq!(push.channel, "public:market/24h_tick");
    handle.shutdown().await;
}

struct Counter(AtomicUsize);

#[async_trait]
impl Periodic for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    async fn tick(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(Error::Internal("every tick fails".to_string()))
    }
}

#[tokio::test]
async fn shutdown_runs_a_final_tick_and_stops() {
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    let job: Arc<dyn Periodic> = counter.clone();
    let handle = spawn_all(vec![(job, Duration::from_millis(10))]);
    tokio::time::sleep(Duration::from_millis(35)).await;
    let before = counter.0.load(Ordering::SeqCst);
    assert!(before >= 2);

    handle.shutdown().await;
    let after = counter.0.load(Ordering::SeqCst);
    assert!(after > before);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(counter.0.load(Ordering::SeqCst), after);
}

/// Panics on its first tick, then counts
struct PanicsOnce(AtomicUsize);

#[async_trait]
impl Periodic for PanicsOnce {
    fn name(&self) -> &'static str {
        "panics-once"
    }

    async fn tick(&self) -> Result<()> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first tick blows up");
        }
        Ok(())
    }
}

#[tokio::test]
async fn panicking_tick_neither_stops_the_job_nor_blocks_shutdown() {
    let job = Arc::new(PanicsOnce(AtomicUsize::new(0)));
    let counter = Arc::new(Counter(AtomicUsize::new(0)));
    let handle = spawn_all(vec![
        (job.clone() as Arc<dyn Periodic>, Duration::from_millis(10)),
        (counter.clone() as Arc<dyn Periodic>, Duration::from_millis(10)),
    ]);
    tokio::time::sleep(Duration::from_millis(35)).await;
    assert!(job.0.load(Ordering::SeqCst) >= 2);

    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("shutdown returned");
    assert!(counter.0.load(Ordering::SeqCst) >= 2);
}
