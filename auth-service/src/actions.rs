//! Two-key email approvals
//!
//! An [`Action`] carries two single-use keys, each delivered in its own email.
//! The action is approved when both keys were presented; the type-specific
//! [`ActionEffect`] then runs exactly once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use common::error::{Error, ErrorExt, Result};
use common::locks::KeyedLocks;
use common::mail::{EmailMessage, MailDispatcher};
use common::model::action::{Action, ActionStatus, ActionType, ApprovalKey};
use common::model::UserId;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

const KEY_LENGTH: usize = 32;

/// Who the approval emails go to
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: UserId,
    pub email: String,
    /// Echoed in every email body when set
    pub anti_phishing_code: Option<String>,
}

/// Action storage
#[async_trait]
pub trait ActionRepository: Send + Sync {
    async fn insert(&self, action: &Action) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Action>>;
    async fn save(&self, action: &Action) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// In-memory action storage
#[derive(Default)]
pub struct InMemoryActionRepository {
    actions: DashMap<Uuid, Action>,
}

impl InMemoryActionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionRepository for InMemoryActionRepository {
    async fn insert(&self, action: &Action) -> Result<()> {
        self.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Action>> {
        Ok(self.actions.get(&id).map(|a| a.clone()))
    }

    async fn save(&self, action: &Action) -> Result<()> {
        self.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.actions.remove(&id);
        Ok(())
    }
}

/// What happens once an action of a given type is approved
#[async_trait]
pub trait ActionEffect: Send + Sync {
    async fn apply(&self, action: &Action) -> Result<()>;
}

/// Result of presenting a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproveOutcome {
    /// One key used, the other is still owed
    AwaitingSecondKey,
    /// Both keys used; the effect ran
    Approved,
    /// The action was approved earlier; nothing ran
    AlreadyApproved,
}

/// Creates actions and applies approvals
pub struct ActionService {
    repo: Arc<dyn ActionRepository>,
    mail: MailDispatcher,
    effects: RwLock<HashMap<ActionType, Arc<dyn ActionEffect>>>,
    /// Serializes approvals of one action
    locks: KeyedLocks<Uuid>,
    public_url: String,
}

impl ActionService {
    pub fn new(repo: Arc<dyn ActionRepository>, mail: MailDispatcher, public_url: &str) -> Self {
        Self {
            repo,
            mail,
            effects: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Register the effect for an action type
    pub fn register_effect(&self, action_type: ActionType, effect: Arc<dyn ActionEffect>) {
        let mut effects = self.effects.write().unwrap_or_else(|e| e.into_inner());
        effects.insert(action_type, effect);
    }

    /// Persist a pending action and send both approval emails
    ///
    /// If either email cannot be sent the action is deleted and the error is
    /// returned so the caller can roll back its own state.
    pub async fn create(
        &self,
        recipient: &Recipient,
        action_type: ActionType,
        data: serde_json::Value,
        summary: &[(&str, String)],
    ) -> Result<Action> {
        let action = Action {
            id: Uuid::new_v4(),
            user_id: recipient.user_id,
            action_type,
            data,
            status: ActionStatus::Pending,
            key_a: generate_key(),
            key_b: generate_key(),
            key_a_used: false,
            key_b_used: false,
            created_at: Utc::now(),
            approved_at: None,
        };
        self.repo.insert(&action).await?;

        for key in [ApprovalKey::A, ApprovalKey::B] {
            let message = self.approval_email(recipient, &action, key, summary);
            let sent = self
                .mail
                .send(message)
                .await
                .with_context(|| format!("sending {:?} approval email", key));
            if let Err(e) = sent {
                warn!(action_id = %action.id, "approval email failed: {}", e);
                self.repo.delete(action.id).await?;
                return Err(e);
            }
        }

        info!(action_id = %action.id, user_id = action.user_id, "{:?} action created", action_type);
        Ok(action)
    }

    pub async fn get(&self, id: Uuid) -> Result<Action> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound("Action not found".to_string()))
    }

    /// Present a key
    pub async fn approve(&self, id: Uuid, key: &str) -> Result<(Action, ApproveOutcome)> {
        let _guard = self.locks.lock(id).await;

        let mut action = self.get(id).await?;
        let which = action
            .which_key(key)
            .ok_or_else(|| Error::InvalidInput("Invalid action key".to_string()))?;

        if action.status == ActionStatus::Approved {
            return Ok((action, ApproveOutcome::AlreadyApproved));
        }

        match which {
            ApprovalKey::A => action.key_a_used = true,
            ApprovalKey::B => action.key_b_used = true,
        }

        if !action.both_keys_used() {
            self.repo.save(&action).await?;
            return Ok((action, ApproveOutcome::AwaitingSecondKey));
        }

        // Approved is persisted before the effect runs; a failed effect leaves
        // the action approved and the keys spent
        action.status = ActionStatus::Approved;
        action.approved_at = Some(Utc::now());
        self.repo.save(&action).await?;

        let effect = {
            let effects = self.effects.read().unwrap_or_else(|e| e.into_inner());
            effects.get(&action.action_type).cloned()
        };
        let Some(effect) = effect else {
            return Err(Error::Internal(format!(
                "no effect registered for {:?}",
                action.action_type
            )));
        };

        effect
            .apply(&action)
            .await
            .with_context(|| format!("{} failed", action.action_type.label()))
            .map_err(|e| {
                error!(action_id = %action.id, "action effect failed: {}", e);
                e
            })?;

        info!(action_id = %action.id, "{:?} action approved", action.action_type);
        Ok((action, ApproveOutcome::Approved))
    }

    fn approval_email(
        &self,
        recipient: &Recipient,
        action: &Action,
        key: ApprovalKey,
        summary: &[(&str, String)],
    ) -> EmailMessage {
        let (secret, part) = match key {
            ApprovalKey::A => (&action.key_a, "1/2"),
            ApprovalKey::B => (&action.key_b, "2/2"),
        };

        let mut body = String::new();
        if let Some(code) = &recipient.anti_phishing_code {
            body.push_str(&format!("Anti-phishing code: {}\n\n", code));
        }
        for (label, value) in summary {
            body.push_str(&format!("{}: {}\n", label, value));
        }
        body.push_str(&format!(
            "\nConfirm ({}): {}/actions/{}/approve?key={}\n",
            part, self.public_url, action.id, secret
        ));

        EmailMessage {
            to: recipient.email.clone(),
            subject: format!("{} ({})", action.action_type.label(), part),
            body,
        }
    }
}

fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Pull the approval key out of an email body
pub fn key_from_email(body: &str) -> Option<String> {
    body.split("key=")
        .nth(1)
        .map(|rest| rest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::mail::MemoryMailer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEffect(AtomicUsize);

    #[async_trait]
    impl ActionEffect for CountingEffect {
        async fn apply(&self, _action: &Action) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recipient() -> Recipient {
        Recipient {
            user_id: 1,
            email: "alice@example.com".to_string(),
            anti_phishing_code: Some("owl".to_string()),
        }
    }

    #[tokio::test]
    async fn effect_runs_once_after_both_keys() {
        let mailer = Arc::new(MemoryMailer::new());
        let service = ActionService::new(
            Arc::new(InMemoryActionRepository::new()),
            MailDispatcher::spawn(mailer.clone(), 1, 8),
            "http://localhost",
        );
        let effect = Arc::new(CountingEffect(AtomicUsize::new(0)));
        service.register_effect(ActionType::ConfirmIp, effect.clone());

        let action = service
            .create(&recipient(), ActionType::ConfirmIp, serde_json::json!({"ip": "1.1.1.1"}), &[])
            .await
            .unwrap();

        let mails = mailer.sent_to("alice@example.com");
        assert_eq!(mails.len(), 2);
        assert!(mails.iter().all(|m| m.body.contains("Anti-phishing code: owl")));
        let key_a = key_from_email(&mails[0].body).unwrap();
        let key_b = key_from_email(&mails[1].body).unwrap();

        let (_, outcome) = service.approve(action.id, &key_a).await.unwrap();
        assert_eq!(outcome, ApproveOutcome::AwaitingSecondKey);
        let (_, outcome) = service.approve(action.id, &key_a).await.unwrap();
        assert_eq!(outcome, ApproveOutcome::AwaitingSecondKey);
        assert_eq!(effect.0.load(Ordering::SeqCst), 0);

        let (approved, outcome) = service.approve(action.id, &key_b).await.unwrap();
        assert_eq!(outcome, ApproveOutcome::Approved);
        assert_eq!(approved.status, ActionStatus::Approved);

        let (_, outcome) = service.approve(action.id, &key_b).await.unwrap();
        assert_eq!(outcome, ApproveOutcome::AlreadyApproved);
        assert_eq!(effect.0.load(Ordering::SeqCst), 1);

        assert!(service.approve(action.id, "wrong").await.is_err());
        assert!(service.locks.is_empty());
    }

    #[tokio::test]
    async fn email_failure_removes_the_action() {
        let mailer = Arc::new(MemoryMailer::new());
        mailer.set_failing(true);
        let repo = Arc::new(InMemoryActionRepository::new());
        let service = ActionService::new(
            repo.clone(),
            MailDispatcher::spawn(mailer, 1, 8),
            "http://localhost",
        );

        let err = service
            .create(&recipient(), ActionType::Withdraw, serde_json::json!({}), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Upstream);
        assert!(repo.actions.is_empty());
    }
}
