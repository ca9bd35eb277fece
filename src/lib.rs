//! In-memory exchange for end-to-end scenarios
//!
//! [`TestExchange`] wires every service the way `exchange-server` does, with
//! in-memory mail, SMS, custody and captcha so tests can read what was sent.

use std::str::FromStr;
use std::sync::Arc;

use account_service::{
    AccountCollaborators, AccountModule, AccountServiceConfig, CoinCatalog, InMemoryFundsEngine,
    MemoryCustodyClient, RepositoryType, StaticRates,
};
use api_gateway::captcha::MemoryCaptchaVerifier;
use api_gateway::{build_router, AppState, GatewayConfig};
use auth_service::actions::key_from_email;
use auth_service::activity::MemoryActivitySink;
use auth_service::{
    ActivityLog, AuthConfig, AuthModule, AuthStores, MemorySmsProvider, StaticRoleSource,
};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::cache::{ActivityTracker, DirtyBalances};
use common::features::{flags, StaticFeatureFlags};
use common::mail::{MailDispatcher, MemoryMailer};
use common::model::balance::BalanceEntry;
use common::model::UserId;
use order_service::{MarketCatalog, OrderModule};
use realtime::{EngineMarketStats, RealtimeConfig, RealtimeModule, RealtimeSources};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt;

/// Source address of harness requests unless a test picks another
pub const DEFAULT_IP: &str = "10.0.0.1";
/// Password that passes the strength policy
pub const PASSWORD: &str = "Str0ng-Passw0rd!";
/// Valid mainnet address for the default BTC coin
pub const BTC_ADDRESS: &str = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";

/// One fully wired exchange
pub struct TestExchange {
    pub router: Router,
    pub state: Arc<AppState>,
    pub mailer: Arc<MemoryMailer>,
    pub sms: Arc<MemorySmsProvider>,
    pub custody: Arc<MemoryCustodyClient>,
    pub funds: Arc<InMemoryFundsEngine>,
    pub flags: Arc<StaticFeatureFlags>,
    pub captcha: Arc<MemoryCaptchaVerifier>,
}

/// Registered and confirmed user with a live session
#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: UserId,
    pub email: String,
    pub token: String,
}

impl TestExchange {
    /// Captcha checks are off; scenarios about captcha flip the flag
    pub async fn new() -> Self {
        let mailer = Arc::new(MemoryMailer::new());
        let sms = Arc::new(MemorySmsProvider::new());
        let custody = Arc::new(MemoryCustodyClient::new());
        let funds = Arc::new(InMemoryFundsEngine::new());
        let captcha = Arc::new(MemoryCaptchaVerifier::new());
        let static_flags = Arc::new(StaticFeatureFlags::new());
        static_flags.set(flags::CAPTCHA_DISABLED, true);

        let mail = MailDispatcher::spawn(mailer.clone(), 1, 64);
        let activity_log = ActivityLog::spawn(Arc::new(MemoryActivitySink::new()), 1, 64);
        let auth = Arc::new(
            AuthModule::build(
                AuthConfig::with_secrets("scenario-session", "scenario-preauth"),
                AuthStores::in_memory(),
                sms.clone(),
                static_flags.clone(),
                mail,
                activity_log,
                &StaticRoleSource::defaults(),
            )
            .await
            .expect("auth module"),
        );

        let rates = Arc::new(StaticRates::new());
        rates.set("usdt", Decimal::new(2, 5));
        rates.set("eth", Decimal::new(5, 2));
        let dirty = Arc::new(DirtyBalances::new());
        let accounts = Arc::new(AccountModule::build(
            AccountServiceConfig::default(),
            RepositoryType::InMemory,
            AccountCollaborators {
                funds: funds.clone(),
                rates,
                custody: custody.clone(),
                coins: Arc::new(CoinCatalog::with_defaults()),
            },
            auth.actions.clone(),
            dirty.clone(),
        ));

        let markets = Arc::new(MarketCatalog::with_defaults());
        let engine = OrderModule::in_memory_engine(&markets, Some(funds.clone()));
        let orders = Arc::new(OrderModule::build(
            engine,
            markets.clone(),
            accounts.sub_accounts.clone(),
            static_flags.clone(),
            dirty.clone(),
        ));

        let activity = Arc::new(ActivityTracker::new());
        let realtime = Arc::new(RealtimeModule::build(
            RealtimeConfig::default(),
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

        let mut config = GatewayConfig::default();
        config.custody_callback_secret = Some("custody-secret".to_string());
        let state = Arc::new(AppState {
            config,
            auth,
            accounts,
            orders,
            realtime,
            flags: static_flags.clone(),
            activity,
            captcha: captcha.clone(),
        });

        Self {
            router: build_router(state.clone()),
            state,
            mailer,
            sms,
            custody,
            funds,
            flags: static_flags,
            captcha,
        }
    }

    /// Send one request through the full router
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for")) {
            builder = builder.header("x-forwarded-for", DEFAULT_IP);
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");

        let response = self.router.clone().oneshot(request).await.expect("router");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        let auth = format!("Bearer {}", token);
        self.send(Method::GET, uri, &[("authorization", &auth)], None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let auth = format!("Bearer {}", token);
        self.send(Method::POST, uri, &[("authorization", &auth)], Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let auth = format!("Bearer {}", token);
        self.send(Method::PUT, uri, &[("authorization", &auth)], Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        let auth = format!("Bearer {}", token);
        self.send(Method::DELETE, uri, &[("authorization", &auth)], None).await
    }

    /// Register through the API and confirm with the returned token
    pub async fn register(&self, email: &str) -> UserId {
        let (status, body) = self
            .send(
                Method::POST,
                "/auth/register",
                &[],
                Some(json!({ "email": email, "password": PASSWORD })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "register {}: {}", email, body);
        let token = body["data"]["preauth_token"].as_str().expect("confirmation token");

        let (status, body) = self
            .send(Method::POST, &format!("/auth/email/confirm/{}", token), &[], None)
            .await;
        assert_eq!(status, StatusCode::OK, "confirm {}: {}", email, body);
        body["data"]["id"].as_i64().expect("user id")
    }

    /// Password login from `ip`
    pub async fn login_from(&self, email: &str, ip: &str) -> (StatusCode, Value) {
        self.send(
            Method::POST,
            "/auth/login",
            &[("x-forwarded-for", ip)],
            Some(json!({ "email": email, "password": PASSWORD })),
        )
        .await
    }

    /// Register, confirm and log in from [`DEFAULT_IP`]
    pub async fn user(&self, email: &str) -> TestUser {
        let id = self.register(email).await;
        let (status, body) = self.login_from(email, DEFAULT_IP).await;
        assert_eq!(status, StatusCode::OK, "login {}: {}", email, body);
        TestUser {
            id,
            email: email.to_string(),
            token: body["data"]["token"].as_str().expect("session token").to_string(),
        }
    }

    /// Keys of the last two approval emails sent to `email`, first part first
    pub fn approval_keys(&self, email: &str) -> (String, String) {
        let sent = self.mailer.sent_to(email);
        assert!(sent.len() >= 2, "expected two approval emails for {}", email);
        let key = |i: usize| key_from_email(&sent[i].body).expect("approval key");
        (key(sent.len() - 2), key(sent.len() - 1))
    }

    /// Open an approval link
    pub async fn approve(&self, action_id: &str, key: &str) -> (StatusCode, Value) {
        let uri = format!("/actions/{}/approve?key={}", action_id, key);
        self.send(Method::GET, &uri, &[], None).await
    }

    /// Open both approval links of the latest action mailed to `email`
    pub async fn approve_latest(&self, email: &str, action_id: &str) -> Value {
        let (first, second) = self.approval_keys(email);
        let (status, _) = self.approve(action_id, &first).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = self.approve(action_id, &second).await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    /// Credit the user's default sub-account
    pub async fn fund(&self, user_id: UserId, coin: &str, amount: &str) {
        let accounts = &self.state.accounts;
        let main = accounts
            .sub_accounts
            .resolve(user_id, None)
            .await
            .expect("default sub-account");
        let amount = Decimal::from_str(amount).expect("amount");
        accounts
            .ledger
            .deposit(user_id, main.id, coin, amount)
            .await
            .expect("deposit");
    }

    /// Balance of one coin in the user's default sub-account
    pub async fn balance(&self, user_id: UserId, coin: &str) -> BalanceEntry {
        self.state
            .accounts
            .ledger
            .balances(user_id, None)
            .await
            .expect("balances")
            .get(coin)
    }
}

/// Decimal field of a JSON body, serialized as a string or a number
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {}", other),
    }
}
