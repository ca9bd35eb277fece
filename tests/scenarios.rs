use axum::http::{Method, StatusCode};
use common::features::flags;
use exchange_tests::{decimal, TestExchange, BTC_ADDRESS, PASSWORD};
use rust_decimal_macros::dec;
use serde_json::json;

#[tokio::test]
async fn register_confirm_and_login() {
    let ex = TestExchange::new().await;
    let id = ex.register("alice@example.com").await;

    let (status, body) = ex.login_from("alice@example.com", "10.0.0.1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user_id"], json!(id));

    let token = body["data"]["token"].as_str().unwrap();
    let (status, body) = ex.get("/profile", token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["user"]["email"], "alice@example.com");

    // Both default sub-accounts exist right after registration
    let (status, body) = ex.get("/sub-accounts", token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unconfirmed_users_cannot_log_in() {
    let ex = TestExchange::new().await;
    let (status, _) = ex
        .send(
            Method::POST,
            "/auth/register",
            &[],
            Some(json!({ "email": "pending@example.com", "password": PASSWORD })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = ex.login_from("pending@example.com", "10.0.0.1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Email is not confirmed");
}

#[tokio::test]
async fn weak_passwords_are_rejected_at_registration() {
    let ex = TestExchange::new().await;
    for password in ["short1!", "alllowercase1!", "NoDigitsHere!", "NoSymbols123"] {
        let (status, body) = ex
            .send(
                Method::POST,
                "/auth/register",
                &[],
                Some(json!({ "email": "weak@example.com", "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{} accepted: {}", password, body);
    }
}

#[tokio::test]
async fn login_from_a_new_ip_needs_email_confirmation() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;

    let (status, _) = ex
        .put("/profile/settings", &alice.token, json!({ "detect_ip_change": true }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = ex.login_from(&alice.email, "192.0.2.7").await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    let action_id = body["action_id"].as_str().unwrap().to_string();
    let preauth = body["preauth_token"].as_str().unwrap().to_string();

    // The partial token alone does not resume the login
    let (status, _) = ex
        .send(
            Method::POST,
            "/auth/ip/resume",
            &[("x-forwarded-for", "192.0.2.7")],
            Some(json!({ "preauth_token": preauth })),
        )
        .await;
    assert_eq!(status, StatusCode::LOCKED);

    let body = ex.approve_latest(&alice.email, &action_id).await;
    assert_eq!(body["data"]["message"], "Action approved");

    let (status, body) = ex
        .send(
            Method::POST,
            "/auth/ip/resume",
            &[("x-forwarded-for", "192.0.2.7")],
            Some(json!({ "preauth_token": preauth })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _) = ex.login_from(&alice.email, "192.0.2.7").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn changing_the_password_revokes_sessions() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;

    let (status, _) = ex
        .post(
            "/auth/password",
            &alice.token,
            json!({ "current_password": PASSWORD, "new_password": "An0ther-Passw0rd!" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = ex.get("/profile", &alice.token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn withdrawal_locks_funds_and_relays_after_both_approvals() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "btc", "1.0").await;

    let (status, body) = ex
        .post(
            "/wallets/withdraw/btc",
            &alice.token,
            json!({ "amount": "0.5", "address": BTC_ADDRESS }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["data"]["status"], "pending");
    assert_eq!(decimal(&body["data"]["fee_amount"]), dec!(0.0005));
    let action_id = body["data"]["action_id"].as_str().unwrap().to_string();

    let btc = ex.balance(alice.id, "btc").await;
    assert_eq!(btc.available, dec!(0.5));
    assert_eq!(btc.in_withdrawals, dec!(0.5));

    // One key leaves the withdrawal pending
    let (first, second) = ex.approval_keys(&alice.email);
    let (status, body) = ex.approve(&action_id, &first).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["message"], "Secondary approval is pending");
    assert!(ex.custody.relayed().is_empty());

    let (status, body) = ex.approve(&action_id, &second).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["message"], "Action approved");
    assert_eq!(ex.custody.relayed().len(), 1);

    // Replaying a key never relays twice
    let (status, body) = ex.approve(&action_id, &second).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["message"], "Action was already approved");
    assert_eq!(ex.custody.relayed().len(), 1);

    let (_, body) = ex.get("/notifications", &alice.token).await;
    assert!(!body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_a_withdrawal_releases_the_lock() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "btc", "1.0").await;

    let (_, body) = ex
        .post(
            "/wallets/withdraw/btc",
            &alice.token,
            json!({ "amount": "0.5", "address": BTC_ADDRESS }),
        )
        .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = ex.delete(&format!("/wallets/withdrawals/{}", id), &alice.token).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "cancelled");

    let btc = ex.balance(alice.id, "btc").await;
    assert_eq!(btc.available, dec!(1.0));
    assert_eq!(btc.in_withdrawals, dec!(0));
}

#[tokio::test]
async fn withdrawals_beyond_the_balance_are_refused() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "btc", "0.1").await;

    let (status, _) = ex
        .post(
            "/wallets/withdraw/btc",
            &alice.token,
            json!({ "amount": "0.5", "address": BTC_ADDRESS }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ex.balance(alice.id, "btc").await.available, dec!(0.1));
}

#[tokio::test]
async fn bulk_create_reports_failures_per_index() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "usdt", "10000").await;

    let (status, body) = ex
        .post(
            "/orders/bulk",
            &alice.token,
            json!([
                { "market": "btcusdt", "side": "buy", "amount": "0.01", "price": "30000" },
                { "market": "ltcusdt", "side": "buy", "amount": "1", "price": "80" },
                { "market": "ethusdt", "side": "buy", "amount": "0.1", "price": "2000" }
            ]),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let results = body["data"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0]["order"]["id"].is_string() || results[0]["order"]["id"].is_number());
    assert!(results[0]["error"].is_null());
    assert!(results[1]["order"].is_null());
    assert!(results[1]["error"].is_string());
    assert!(results[2]["error"].is_null());
}

#[tokio::test]
async fn replacing_a_partially_filled_order_is_refused() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    let bob = ex.user("bob@example.com").await;
    ex.fund(alice.id, "btc", "1").await;
    ex.fund(bob.id, "usdt", "20000").await;

    let (status, body) = ex
        .post(
            "/orders/btcusdt/sell",
            &alice.token,
            json!({ "amount": "1", "price": "30000" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let original = body["data"]["id"].clone();

    let (status, _) = ex
        .post(
            "/orders/btcusdt/buy",
            &bob.token,
            json!({ "amount": "0.4", "price": "30000" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = ex
        .post(
            "/orders/btcusdt/sell",
            &alice.token,
            json!({ "amount": "1", "price": "31000", "order_id": original }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Original order is partially filled, unable to replace");
}

#[tokio::test]
async fn replacing_an_untouched_order_cancels_it() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "usdt", "1000").await;

    let (_, body) = ex
        .post(
            "/orders/btcusdt/buy",
            &alice.token,
            json!({ "amount": "0.01", "price": "30000" }),
        )
        .await;
    let original = body["data"]["id"].clone();

    let (status, body) = ex
        .post(
            "/orders/btcusdt/buy",
            &alice.token,
            json!({ "amount": "0.01", "price": "29000", "order_id": original }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_ne!(body["data"]["id"], original);

    let (status, body) = ex.get(&format!("/orders/{}", original), &alice.token).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");
}

#[tokio::test]
async fn foreign_user_channels_are_refused() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    let bob = ex.user("bob@example.com").await;
    let hub = &ex.state.realtime.hub;

    let (id, mut pushes) = hub.connect();
    let err = hub
        .subscribe(
            id,
            &format!("user:balances#{}", bob.id),
            Some(&alice.token),
            "10.0.0.1",
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), common::ErrorKind::AccessDenied);
    assert!(pushes.try_recv().is_err());

    // Own channel is accepted
    let channel = hub
        .subscribe(
            id,
            &format!("user:balances#{}", alice.id),
            Some(&alice.token),
            "10.0.0.1",
        )
        .await
        .unwrap();
    assert!(hub.unsubscribe(id, &channel));
    hub.disconnect(id);
}

#[tokio::test]
async fn api_key_activates_once_after_two_approvals() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;

    let (status, body) = ex
        .post("/api-keys", &alice.token, json!({ "version": "v1" }))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let secret = body["data"]["secret"].as_str().unwrap().to_string();
    let action_id = body["data"]["action_id"].as_str().unwrap().to_string();

    // Inactive until approved
    let (status, _) = ex
        .send(Method::GET, "/balances", &[("x-api-key", &secret)], None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (first, second) = ex.approval_keys(&alice.email);
    for _ in 0..2 {
        let (_, body) = ex.approve(&action_id, &first).await;
        assert_eq!(body["data"]["message"], "Secondary approval is pending");
    }
    let (_, body) = ex.approve(&action_id, &second).await;
    assert_eq!(body["data"]["message"], "Action approved");

    let (status, _) = ex
        .send(Method::GET, "/balances", &[("x-api-key", &secret)], None)
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn captcha_is_enforced_unless_disabled() {
    let ex = TestExchange::new().await;
    let register = json!({ "email": "carol@example.com", "password": PASSWORD });

    ex.flags.set(flags::CAPTCHA_DISABLED, false);
    let (status, body) = ex
        .send(Method::POST, "/auth/register", &[], Some(register.clone()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Captcha is required");

    let (status, body) = ex
        .send(
            Method::POST,
            "/auth/register",
            &[("x-captcha-token", "bogus")],
            Some(register.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Captcha verification failed");

    ex.captcha.accept("solved");
    let (status, _) = ex
        .send(
            Method::POST,
            "/auth/register",
            &[("x-captcha-token", "solved")],
            Some(register),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    ex.flags.set(flags::CAPTCHA_DISABLED, true);
    let (status, _) = ex
        .send(
            Method::POST,
            "/auth/register",
            &[],
            Some(json!({ "email": "dave@example.com", "password": PASSWORD })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn market_data_is_public() {
    let ex = TestExchange::new().await;
    let (status, body) = ex.send(Method::GET, "/markets", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["data"].as_array().unwrap().is_empty());

    let (status, _) = ex.send(Method::GET, "/markets/btcusdt/depth", &[], None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = ex.send(Method::GET, "/markets/dogeusdt/trades", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn custody_callbacks_need_the_shared_secret() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "btc", "1.0").await;

    let (_, body) = ex
        .post(
            "/wallets/withdraw/btc",
            &alice.token,
            json!({ "amount": "0.5", "address": BTC_ADDRESS }),
        )
        .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    let action_id = body["data"]["action_id"].as_str().unwrap().to_string();
    ex.approve_latest(&alice.email, &action_id).await;

    let uri = format!("/custody/withdrawals/{}", id);
    let (status, _) = ex
        .send(
            Method::POST,
            &uri,
            &[("x-custody-token", "wrong")],
            Some(json!({ "status": "completed" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = ex
        .send(
            Method::POST,
            &uri,
            &[("x-custody-token", "custody-secret")],
            Some(json!({ "status": "completed" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "completed");

    let btc = ex.balance(alice.id, "btc").await;
    assert_eq!(btc.available, dec!(0.5));
    assert_eq!(btc.in_withdrawals, dec!(0));
}

#[tokio::test]
async fn blocked_users_lose_api_key_access() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;

    let (_, body) = ex
        .post("/api-keys", &alice.token, json!({ "version": "v1" }))
        .await;
    let secret = body["data"]["secret"].as_str().unwrap().to_string();
    let action_id = body["data"]["action_id"].as_str().unwrap().to_string();
    ex.approve_latest(&alice.email, &action_id).await;

    let (status, _) = ex
        .send(Method::GET, "/balances", &[("x-api-key", &secret)], None)
        .await;
    assert_eq!(status, StatusCode::OK);

    ex.state
        .auth
        .identity
        .update_status(alice.id, common::model::user::UserStatus::Blocked)
        .await
        .unwrap();

    let (status, _) = ex.get("/balances", &alice.token).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = ex
        .send(Method::GET, "/balances", &[("x-api-key", &secret)], None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "Account is blocked");
}

#[tokio::test]
async fn role_changes_apply_to_live_sessions() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    let identity = &ex.state.auth.identity;

    let (status, _) = ex.get("/admin/withdrawals", &alice.token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    identity.update_role(alice.id, "admin").await.unwrap();
    let (status, _) = ex.get("/admin/withdrawals", &alice.token).await;
    assert_eq!(status, StatusCode::OK);

    identity.update_role(alice.id, "member").await.unwrap();
    let (status, _) = ex.get("/admin/withdrawals", &alice.token).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn pages_past_the_end_are_empty() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    let huge = usize::MAX / 10;

    for uri in [
        format!("/orders?page={}", huge),
        format!("/notifications?page={}", huge),
    ] {
        let (status, body) = ex.get(&uri, &alice.token).await;
        assert_eq!(status, StatusCode::OK, "{}: {}", uri, body);
        assert!(body["data"].as_array().unwrap().is_empty());
    }
}

#[tokio::test]
async fn open_orders_lock_funds_until_cancelled() {
    let ex = TestExchange::new().await;
    let alice = ex.user("alice@example.com").await;
    ex.fund(alice.id, "usdt", "1000").await;

    let (status, body) = ex
        .post(
            "/orders/btcusdt/buy",
            &alice.token,
            json!({ "amount": "0.01", "price": "30000" }),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    let order_id = body["data"]["id"].clone();
    let usdt = ex.balance(alice.id, "usdt").await;
    assert_eq!(usdt.available, decimal(&json!("700")));
    assert_eq!(usdt.in_orders, decimal(&json!("300")));

    let (status, body) = ex
        .post(
            "/orders/btcusdt/buy",
            &alice.token,
            json!({ "amount": "1", "price": "30000" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Insufficient balance");

    let (status, body) = ex
        .delete(&format!("/orders/btcusdt/{}", order_id), &alice.token)
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let usdt = ex.balance(alice.id, "usdt").await;
    assert_eq!(usdt.available, decimal(&json!("1000")));
    assert!(usdt.in_orders.is_zero());
}
