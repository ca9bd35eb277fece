use std::sync::Arc;

use auth_service::activity::MemoryActivitySink;
use auth_service::actions::key_from_email;
use auth_service::two_factor::totp;
use auth_service::{
    ActivityLog, AuthConfig, AuthModule, AuthStores, LoginOutcome, LoginRequest,
    MemorySmsProvider, StaticRoleSource,
};
use chrono::Utc;
use common::mail::{MailDispatcher, MemoryMailer};
use common::model::user::{IpStatus, TwoFactorMethod, UserStatus};
use common::{ErrorKind, StaticFeatureFlags};

const PASSWORD: &str = "Sup3r$ecret";

struct Harness {
    auth: AuthModule,
    mailer: Arc<MemoryMailer>,
    sms: Arc<MemorySmsProvider>,
    activity: Arc<MemoryActivitySink>,
}

async fn harness() -> Harness {
    let mailer = Arc::new(MemoryMailer::new());
    let sms = Arc::new(MemorySmsProvider::new());
    let activity = Arc::new(MemoryActivitySink::new());
    let auth = AuthModule::build(
        AuthConfig::with_secrets("session", "preauth"),
        AuthStores::in_memory(),
        sms.clone(),
        Arc::new(StaticFeatureFlags::new()),
        MailDispatcher::spawn(mailer.clone(), 1, 16),
        ActivityLog::spawn(activity.clone(), 1, 16),
        &StaticRoleSource::defaults(),
    )
    .await
    .unwrap();
    Harness {
        auth,
        mailer,
        sms,
        activity,
    }
}

fn login(email: &str, ip: &str) -> LoginRequest {
    LoginRequest {
        email: email.to_string(),
        password: PASSWORD.to_string(),
        ip: ip.to_string(),
        remember: false,
    }
}

async fn active_user(h: &Harness, email: &str) -> i64 {
    let registration = h
        .auth
        .service
        .register(email, PASSWORD, None, "10.0.0.1")
        .await
        .unwrap();
    h.auth
        .service
        .confirm_email(&registration.confirmation_token)
        .await
        .unwrap();
    registration.user.id
}

#[tokio::test]
async fn pending_user_cannot_log_in_until_confirmed() {
    let h = harness().await;
    let registration = h
        .auth
        .service
        .register("alice@example.com", PASSWORD, None, "10.0.0.1")
        .await
        .unwrap();
    assert_eq!(registration.user.status, UserStatus::Pending);

    let err = h
        .auth
        .service
        .login(login("alice@example.com", "10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Email is not confirmed");

    let user = h
        .auth
        .service
        .confirm_email(&registration.confirmation_token)
        .await
        .unwrap();
    assert_eq!(user.status, UserStatus::Active);

    let outcome = h
        .auth
        .service
        .login(login("alice@example.com", "10.0.0.1"))
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Session(_)));
}

#[tokio::test]
async fn weak_password_and_duplicate_email_are_rejected() {
    let h = harness().await;
    let err = h
        .auth
        .service
        .register("bob@example.com", "weak", None, "10.0.0.1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    active_user(&h, "bob@example.com").await;
    let err = h
        .auth
        .service
        .register("BOB@example.com", PASSWORD, None, "10.0.0.1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let h = harness().await;
    active_user(&h, "carol@example.com").await;
    let mut request = login("carol@example.com", "10.0.0.1");
    request.password = "Wr0ng$pass".to_string();
    let err = h.auth.service.login(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let err = h
        .auth
        .service
        .login(login("nobody@example.com", "10.0.0.1"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn google_auth_login_needs_second_step() {
    let h = harness().await;
    let user_id = active_user(&h, "dave@example.com").await;

    let secret = h.auth.service.new_google_auth_secret();
    let now = Utc::now().timestamp() as u64;
    let code = totp::code_at(&secret, now).unwrap();
    h.auth
        .service
        .enable_google_auth(user_id, &secret, &code)
        .await
        .unwrap();

    let outcome = h
        .auth
        .service
        .login(login("dave@example.com", "10.0.0.1"))
        .await
        .unwrap();
    let preauth_token = match outcome {
        LoginOutcome::TwoFactorRequired {
            preauth_token,
            method,
        } => {
            assert_eq!(method, TwoFactorMethod::GoogleAuth);
            preauth_token
        }
        other => panic!("unexpected outcome: {:?}", other),
    };

    // The pre-auth token is not a session
    assert!(h.auth.service.authenticate(&preauth_token, "10.0.0.1").is_err());
    assert!(h
        .auth
        .service
        .complete_two_factor(&preauth_token, "000000x", "10.0.0.1")
        .await
        .is_err());

    let code = totp::code_at(&secret, Utc::now().timestamp() as u64).unwrap();
    let issued = h
        .auth
        .service
        .complete_two_factor(&preauth_token, &code, "10.0.0.1")
        .await
        .unwrap();
    let claims = h.auth.service.authenticate(&issued.token, "10.0.0.1").unwrap();
    assert_eq!(claims.user_id().unwrap(), user_id);
}

#[tokio::test]
async fn sms_login_sends_a_code() {
    let h = harness().await;
    let user_id = active_user(&h, "erin@example.com").await;

    h.auth
        .service
        .request_sms_enrollment(user_id, "+15550001")
        .await
        .unwrap();
    let code = h.sms.last_code("+15550001").unwrap();
    h.auth
        .service
        .enable_sms(user_id, "+15550001", &code)
        .await
        .unwrap();

    // The enrollment code used the rate-limit slot; login still asks for the second factor
    let outcome = h
        .auth
        .service
        .login(login("erin@example.com", "10.0.0.1"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        LoginOutcome::TwoFactorRequired {
            method: TwoFactorMethod::Sms,
            ..
        }
    ));
}

#[tokio::test]
async fn new_ip_requires_email_confirmation() {
    let h = harness().await;
    let user_id = active_user(&h, "frank@example.com").await;
    h.auth
        .service
        .update_settings(
            user_id,
            auth_service::service::SettingsUpdate {
                detect_ip_change: Some(true),
                anti_phishing_code: Some(Some("owl42".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Registration IP is trusted
    let outcome = h
        .auth
        .service
        .login(login("frank@example.com", "10.0.0.1"))
        .await
        .unwrap();
    let LoginOutcome::Session(issued) = outcome else {
        panic!("expected a session");
    };
    // Sessions are pinned to the IP when detection is on
    assert!(h.auth.service.authenticate(&issued.token, "10.9.9.9").is_err());

    let outcome = h
        .auth
        .service
        .login(login("frank@example.com", "10.0.0.2"))
        .await
        .unwrap();
    let (preauth_token, action_id) = match outcome {
        LoginOutcome::IpConfirmationRequired {
            preauth_token,
            action_id,
        } => (preauth_token, action_id),
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(
        h.auth.users.ip_status(user_id, "10.0.0.2").await.unwrap(),
        Some(IpStatus::Pending)
    );

    let mails: Vec<_> = h
        .mailer
        .sent_to("frank@example.com")
        .into_iter()
        .filter(|m| m.body.contains(&action_id.to_string()))
        .collect();
    assert_eq!(mails.len(), 2);
    assert!(mails.iter().all(|m| m.body.contains("owl42")));

    let err = h
        .auth
        .service
        .resume_after_ip_confirmation(&preauth_token, "10.0.0.2")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionRequired);

    for mail in &mails {
        let key = key_from_email(&mail.body).unwrap();
        h.auth.actions.approve(action_id, &key).await.unwrap();
    }
    assert_eq!(
        h.auth.users.ip_status(user_id, "10.0.0.2").await.unwrap(),
        Some(IpStatus::Approved)
    );

    let outcome = h
        .auth
        .service
        .resume_after_ip_confirmation(&preauth_token, "10.0.0.2")
        .await
        .unwrap();
    assert!(matches!(outcome, LoginOutcome::Session(_)));
}

#[tokio::test]
async fn password_change_revokes_every_session() {
    let h = harness().await;
    let user_id = active_user(&h, "grace@example.com").await;

    let mut tokens = Vec::new();
    for _ in 0..2 {
        match h
            .auth
            .service
            .login(login("grace@example.com", "10.0.0.1"))
            .await
            .unwrap()
        {
            LoginOutcome::Session(issued) => tokens.push(issued.token),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
    for token in &tokens {
        assert!(h.auth.service.authenticate(token, "10.0.0.1").is_ok());
    }

    h.auth
        .service
        .change_password(user_id, PASSWORD, "N3w$ecret!")
        .await
        .unwrap();

    for token in &tokens {
        let err = h.auth.service.authenticate(token, "10.0.0.1").unwrap_err();
        assert_eq!(err.to_string(), "Invalid token");
    }

    let mut request = login("grace@example.com", "10.0.0.1");
    request.password = "N3w$ecret!".to_string();
    assert!(h.auth.service.login(request).await.is_ok());
}

#[tokio::test]
async fn logout_revokes_only_that_session() {
    let h = harness().await;
    active_user(&h, "heidi@example.com").await;

    let mut sessions = Vec::new();
    for _ in 0..2 {
        if let LoginOutcome::Session(issued) = h
            .auth
            .service
            .login(login("heidi@example.com", "10.0.0.1"))
            .await
            .unwrap()
        {
            sessions.push(issued);
        }
    }

    h.auth.service.logout(&sessions[0].claims).await.unwrap();
    assert!(h.auth.service.authenticate(&sessions[0].token, "10.0.0.1").is_err());
    assert!(h.auth.service.authenticate(&sessions[1].token, "10.0.0.1").is_ok());

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!h.activity.events().is_empty());
}
