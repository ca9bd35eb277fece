//! HTTP and WebSocket surface of the exchange core
//!
//! [`build_router`] assembles every route with its gates:
//! - public routes (market data, email links, second login steps)
//! - captcha-gated routes (registration, password login)
//! - authenticated routes, reached with a session token or an API key

pub mod api;
pub mod captcha;
pub mod config;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post, put};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{warn, Level};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

pub use config::GatewayConfig;
pub use state::AppState;

use crate::api::{account, actions, api_keys, auth, market, notifications, order, profile, wallet};
use crate::middleware::{require_auth, require_captcha};
use crate::ws::ws_handler;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// API documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        // Auth routes
        auth::register,
        auth::confirm_email,
        auth::resend_confirmation,
        auth::login,
        auth::complete_two_factor,
        auth::resend_login_sms,
        auth::resume_after_ip_confirmation,
        auth::logout,
        auth::change_password,
        // Profile routes
        profile::get_profile,
        profile::update_settings,
        profile::set_trade_password,
        profile::google_auth_secret,
        profile::enable_google_auth,
        profile::request_sms_enrollment,
        profile::enable_sms,
        profile::set_primary_two_factor,
        profile::disable_two_factor,
        // Actions
        actions::approve,
        // API keys
        api_keys::list_keys,
        api_keys::create_key,
        api_keys::delete_key,
        // Account routes
        account::list_sub_accounts,
        account::create_sub_account,
        account::update_sub_account,
        account::transfer,
        account::balances,
        // Order routes
        order::create_order,
        order::create_bulk,
        order::cancel_order,
        order::cancel_bulk,
        order::list_orders,
        order::get_order,
        // Market routes
        market::list_markets,
        market::depth,
        market::trades,
        // Wallet routes
        wallet::withdraw,
        wallet::list_withdrawals,
        wallet::cancel_withdrawal,
        wallet::admin_list,
        wallet::admin_cancel,
        wallet::admin_reprocess,
        wallet::custody_callback,
        // Notifications
        notifications::list_notifications,
        notifications::unread_count,
        notifications::mark_read,
        notifications::mark_all_read,
    ),
    components(
        schemas(
            // Auth API
            auth::RegisterRequest,
            auth::RegisterResponse,
            auth::EmailRequest,
            auth::LoginBody,
            auth::SessionResponse,
            auth::TwoFactorLoginRequest,
            auth::PreAuthRequest,
            auth::ChangePasswordRequest,
            common::model::user::User,
            common::model::user::UserStatus,
            common::model::user::UserSettings,
            common::model::user::TwoFactorMethod,

            // Profile API
            profile::Profile,
            profile::SettingsRequest,
            profile::TradePasswordRequest,
            profile::GoogleAuthRequest,
            profile::SmsDestination,
            profile::SmsEnableRequest,
            profile::TwoFactorChange,

            // Actions and keys
            actions::ApproveResponse,
            common::model::action::ActionType,
            common::model::action::ActionStatus,
            api_keys::CreateApiKeyRequest,
            api_keys::CreatedApiKeyResponse,
            common::model::api_key::ApiKey,
            common::model::api_key::ApiKeyVersion,
            common::model::api_key::ApiKeyStatus,
            common::model::api_key::ApiKeyCapabilities,

            // Account API
            account::CreateSubAccountRequest,
            account::UpdateSubAccountRequest,
            account::TransferRequest,
            common::model::sub_account::SubAccount,
            common::model::sub_account::AccountGroup,
            common::model::sub_account::MarketType,
            common::model::sub_account::SubAccountStatus,
            common::model::balance::Balances,
            common::model::balance::BalanceEntry,

            // Order and market API
            common::model::order::Order,
            common::model::order::Side,
            common::model::order::OrderType,
            common::model::order::StopKind,
            common::model::order::TrailingKind,
            common::model::order::TrailingStop,
            common::model::order::Status,
            common::model::order::UiSource,
            common::model::market::Market,

            // Wallet API
            wallet::WithdrawBody,
            wallet::CustodyReport,
            common::model::withdraw::WithdrawRequest,
            common::model::withdraw::WithdrawStatus,
            common::model::withdraw::ExternalSystem,

            // Notifications
            common::model::notification::Notification,

            // Envelopes
            api::response::ListMeta,
            api::response::Paging,
            error::ErrorResponse,
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "auth", description = "Registration, login and sessions"),
        (name = "profile", description = "Profile, settings and second factors"),
        (name = "actions", description = "Two-key email approvals"),
        (name = "api-keys", description = "API key management"),
        (name = "account", description = "Sub-accounts, transfers and balances"),
        (name = "order", description = "Order management endpoints"),
        (name = "market", description = "Market data endpoints"),
        (name = "wallet", description = "Withdrawals"),
        (name = "admin", description = "Operator endpoints"),
        (name = "custody", description = "Custody callbacks"),
        (name = "notifications", description = "User notifications")
    ),
    info(
        title = "Exchange Core API",
        version = "1.0.0",
        description = "User, account, order and withdrawal API of the exchange core"
    )
)]
pub struct ApiDoc;

fn cors(config: &GatewayConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if config.cors_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Every route, gate and tower layer of the gateway
pub fn build_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/auth/email/confirm/:token", post(auth::confirm_email))
        .route("/auth/2fa/login", post(auth::complete_two_factor))
        .route("/auth/2fa/sms/resend", post(auth::resend_login_sms))
        .route("/auth/ip/resume", post(auth::resume_after_ip_confirmation))
        .route("/actions/:id/approve", get(actions::approve).post(actions::approve))
        .route("/markets", get(market::list_markets))
        .route("/markets/:market/depth", get(market::depth))
        .route("/markets/:market/trades", get(market::trades))
        .route("/custody/withdrawals/:id", post(wallet::custody_callback));

    let captcha_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/email/resend", post(auth::resend_confirmation))
        .route_layer(from_fn_with_state(state.clone(), require_captcha));

    let protected_routes = Router::new()
        // Session
        .route("/auth/logout", post(auth::logout))
        .route("/auth/password", post(auth::change_password))
        // Profile
        .route("/profile", get(profile::get_profile))
        .route("/profile/settings", put(profile::update_settings))
        .route("/profile/trade-password", post(profile::set_trade_password))
        .route("/profile/2fa/google/secret", get(profile::google_auth_secret))
        .route("/profile/2fa/google", post(profile::enable_google_auth))
        .route("/profile/2fa/sms/request", post(profile::request_sms_enrollment))
        .route("/profile/2fa/sms", post(profile::enable_sms))
        .route("/profile/2fa/primary", post(profile::set_primary_two_factor))
        .route("/profile/2fa/disable", post(profile::disable_two_factor))
        // API keys
        .route("/api-keys", get(api_keys::list_keys).post(api_keys::create_key))
        .route("/api-keys/:id", delete(api_keys::delete_key))
        // Sub-accounts and balances
        .route(
            "/sub-accounts",
            get(account::list_sub_accounts).post(account::create_sub_account),
        )
        .route("/sub-accounts/transfer", post(account::transfer))
        .route("/sub-accounts/:id", put(account::update_sub_account))
        .route("/balances", get(account::balances))
        // Orders
        .route("/orders", get(order::list_orders))
        .route(
            "/orders/bulk",
            post(order::create_bulk).delete(order::cancel_bulk),
        )
        .route("/orders/:id", get(order::get_order))
        // Second segment is the side on POST and the order id on DELETE
        .route(
            "/orders/:market/:target",
            post(order::create_order).delete(order::cancel_order),
        )
        // Wallets
        .route("/wallets/withdraw/:coin", post(wallet::withdraw))
        .route("/wallets/withdrawals", get(wallet::list_withdrawals))
        .route("/wallets/withdrawals/:id", delete(wallet::cancel_withdrawal))
        .route("/admin/withdrawals", get(wallet::admin_list))
        .route("/admin/withdrawals/:id/cancel", post(wallet::admin_cancel))
        .route("/admin/withdrawals/:id/reprocess", post(wallet::admin_reprocess))
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread", get(notifications::unread_count))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/:id/read", post(notifications::mark_read))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let swagger_ui = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi());

    Router::new()
        .merge(public_routes)
        .merge(captcha_routes)
        .merge(protected_routes)
        .route("/ws", get(ws_handler))
        .merge(swagger_ui)
        .layer(cors(&state.config))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
