//! Custody relay port
//!
//! Approved withdrawals are handed to the custody signer (or a fiat
//! provider); it answers with an external reference and later reports the
//! final state back through the custody callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use common::error::{Error, Result};
use common::model::withdraw::WithdrawRequest;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

/// Downstream signer for approved withdrawals
#[async_trait]
pub trait CustodyClient: Send + Sync {
    /// Hand a withdrawal over; returns the custody reference
    async fn relay(&self, request: &WithdrawRequest) -> Result<String>;
}

/// Custody kept in memory; records every relayed request
#[derive(Default)]
pub struct MemoryCustodyClient {
    relayed: Mutex<Vec<WithdrawRequest>>,
    failing: AtomicBool,
}

impl MemoryCustodyClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn relayed(&self) -> Vec<WithdrawRequest> {
        self.relayed
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CustodyClient for MemoryCustodyClient {
    async fn relay(&self, request: &WithdrawRequest) -> Result<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Upstream("custody unavailable".to_string()));
        }
        let mut relayed = self
            .relayed
            .lock()
            .map_err(|_| Error::Internal("custody log poisoned".to_string()))?;
        relayed.push(request.clone());
        Ok(format!("mem-{}", relayed.len()))
    }
}

#[derive(Serialize)]
struct RelayBody<'a> {
    withdraw_id: Uuid,
    coin: &'a str,
    amount: String,
    fee: String,
    destination: &'a str,
    external_system: common::model::withdraw::ExternalSystem,
}

#[derive(Deserialize)]
struct RelayResponse {
    id: String,
}

/// Custody signer reached over HTTP
pub struct HttpCustodyClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCustodyClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CustodyClient for HttpCustodyClient {
    async fn relay(&self, request: &WithdrawRequest) -> Result<String> {
        let body = RelayBody {
            withdraw_id: request.id,
            coin: &request.coin_symbol,
            amount: request.net_amount().to_string(),
            fee: request.fee_amount.to_string(),
            destination: &request.destination,
            external_system: request.external_system,
        };
        let url = format!("{}/withdrawals", self.base_url);
        debug!(withdraw_id = %request.id, "relaying to {}", url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("custody request failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(withdraw_id = %request.id, status = %response.status(), "custody rejected withdrawal");
            return Err(Error::Upstream(format!(
                "custody answered {}",
                response.status()
            )));
        }

        let parsed: RelayResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("custody response unreadable: {}", e)))?;
        Ok(parsed.id)
    }
}
