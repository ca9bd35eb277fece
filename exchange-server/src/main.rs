//! Exchange core API server

use std::net::SocketAddr;
use std::sync::Arc;

use account_service::{
    AccountCollaborators, AccountModule, AccountServiceConfig, HttpCustodyClient,
    InMemoryFundsEngine, RepositoryType,
};
use api_gateway::captcha::{CaptchaVerifier, HttpCaptchaVerifier, MemoryCaptchaVerifier};
use api_gateway::{build_router, AppState, GatewayConfig};
use auth_service::activity::{LogActivitySink, PostgresActivitySink};
use auth_service::{
    ActivityLog, ActivitySink, AuthConfig, AuthModule, AuthStores, MemorySmsProvider,
    PostgresUserRepository, StaticRoleSource,
};
use clap::Parser;
use common::cache::{ActivityTracker, DirtyBalances};
use common::db::{init_db_pool, run_migrations, DbPool};
use common::features::{flags, FeatureFlags, StaticFeatureFlags};
use common::mail::{LogMailer, MailDispatcher};
use dotenv::dotenv;
use order_service::{MarketCatalog, OrderModule};
use realtime::{EngineMarketStats, RealtimeConfig, RealtimeModule, RealtimeSources};
use rust_decimal_macros::dec;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter, FmtSubscriber};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Exchange core API server
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Listening address; overrides API_ADDR
    #[clap(short, long)]
    addr: Option<String>,

    /// Seed a confirmed demo user with funded balances
    #[clap(long)]
    demo: bool,
}

fn init_tracing() -> Result<(), BoxError> {
    // Debug level when DEBUG=1 env var is set
    let env = std::env::var("DEBUG").unwrap_or_else(|_| "0".to_string());
    let log_level = if env == "1" { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .parse("tower_http=debug,api_gateway=debug")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    debug!("Debug logging enabled");
    Ok(())
}

async fn database(config: &AccountServiceConfig) -> Result<Option<DbPool>, BoxError> {
    let Some(url) = config.database_url.as_deref() else {
        info!("DATABASE_URL not set, using in-memory storage");
        return Ok(None);
    };
    let pool = init_db_pool(url, config.db_pool_size).await?;
    run_migrations(&pool).await?;
    Ok(Some(pool))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    let args = Args::parse();
    init_tracing()?;

    let mut gateway_config = GatewayConfig::from_env();
    if let Some(addr) = args.addr {
        gateway_config.addr = addr;
    }
    let account_config = AccountServiceConfig::from_env();
    let pool = database(&account_config).await?;

    // Background pools
    let mail = MailDispatcher::spawn(Arc::new(LogMailer), 2, 1024);
    let sink: Arc<dyn ActivitySink> = match &pool {
        Some(pool) => Arc::new(PostgresActivitySink::new(pool.clone())),
        None => Arc::new(LogActivitySink),
    };
    let activity_log = ActivityLog::spawn(sink, 2, 4096);
    let static_flags = Arc::new(StaticFeatureFlags::new());
    let captcha: Arc<dyn CaptchaVerifier> = match gateway_config.captcha_url.as_deref() {
        Some(url) => Arc::new(HttpCaptchaVerifier::new(url, &gateway_config.captcha_secret)),
        None => {
            warn!("CAPTCHA_URL not set, captcha checks are disabled");
            static_flags.set(flags::CAPTCHA_DISABLED, true);
            Arc::new(MemoryCaptchaVerifier::new())
        }
    };
    let flags: Arc<dyn FeatureFlags> = static_flags;

    // Auth
    let mut stores = AuthStores::in_memory();
    if let Some(pool) = &pool {
        stores.users = Arc::new(PostgresUserRepository::new(pool.clone()));
    }
    let auth = Arc::new(
        AuthModule::build(
            AuthConfig::from_env(),
            stores,
            Arc::new(MemorySmsProvider::new()),
            flags.clone(),
            mail,
            activity_log,
            &StaticRoleSource::defaults(),
        )
        .await?,
    );

    // Accounts
    let dirty = Arc::new(DirtyBalances::new());
    let funds = Arc::new(InMemoryFundsEngine::new());
    let mut collaborators = AccountCollaborators::in_memory();
    collaborators.funds = funds.clone();
    match account_config.custody_url.as_deref() {
        Some(url) => collaborators.custody = Arc::new(HttpCustodyClient::new(url)),
        None => warn!("CUSTODY_URL not set, withdrawals are relayed to an in-memory custody"),
    }
    let repository = match pool {
        Some(pool) => RepositoryType::Postgres(pool),
        None => RepositoryType::InMemory,
    };
    let accounts = Arc::new(AccountModule::build(
        account_config,
        repository,
        collaborators,
        auth.actions.clone(),
        dirty.clone(),
    ));

    // Orders
    let markets = Arc::new(MarketCatalog::with_defaults());
    let engine = OrderModule::in_memory_engine(&markets, Some(funds));
    let orders = Arc::new(OrderModule::build(
        engine,
        markets.clone(),
        accounts.sub_accounts.clone(),
        flags.clone(),
        dirty.clone(),
    ));

    // Realtime
    let activity = Arc::new(ActivityTracker::new());
    let realtime = Arc::new(RealtimeModule::build(
        RealtimeConfig::from_env(),
        auth.service.clone(),
        RealtimeSources {
            ledger: accounts.ledger.clone(),
            dirty,
            activity: activity.clone(),
            engine: orders.engine.clone(),
            updates: orders.updates.clone(),
            rates: accounts.rates.clone(),
            stats: Arc::new(EngineMarketStats::new(orders.engine.clone(), markets)),
            tokens: auth.tokens.clone(),
        },
    ));
    let dispatchers = realtime.start();

    if args.demo {
        seed_demo(&auth, &accounts).await?;
    }

    let addr: SocketAddr = gateway_config.addr.parse()?;
    let state = Arc::new(AppState {
        config: gateway_config,
        auth,
        accounts,
        orders,
        realtime,
        flags,
        activity,
        captcha,
    });
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    // Run until interrupt signal
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    dispatchers.shutdown().await;
    info!("Dispatchers stopped");
    Ok(())
}

/// Confirmed demo user with funds in its default sub-account
async fn seed_demo(auth: &AuthModule, accounts: &AccountModule) -> Result<(), BoxError> {
    let email = std::env::var("DEMO_EMAIL").unwrap_or_else(|_| "demo@example.com".to_string());
    let password = std::env::var("DEMO_PASSWORD").unwrap_or_else(|_| "Demo-Passw0rd!".to_string());

    let registration = auth.service.register(&email, &password, None, "127.0.0.1").await?;
    let user = auth.service.confirm_email(&registration.confirmation_token).await?;
    let subs = accounts.sub_accounts.create_defaults(user.id).await?;
    let Some(default) = subs.iter().find(|s| s.is_default) else {
        return Err("demo user has no default sub-account".into());
    };

    accounts.ledger.deposit(user.id, default.id, "usdt", dec!(100000)).await?;
    accounts.ledger.deposit(user.id, default.id, "btc", dec!(2)).await?;
    accounts.ledger.deposit(user.id, default.id, "eth", dec!(20)).await?;
    info!(user_id = user.id, %email, "demo user seeded");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}
