//! Custodian capability
//!
//! A custodian is one bot identity on the trading platform. The runner only
//! sees this trait; the shipped implementation talks to a protocol-bridge
//! sidecar that owns the live platform session.

use crate::types::{ConnectionState, InventoryItem, OfferSpec, RemoteOffer};
use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Escrow days reported when the platform cannot determine the hold period
pub const ESCROW_UNDETERMINED: u32 = 123;

/// Remote operations of one bot identity
#[async_trait]
pub trait Custodian: Send + Sync {
    fn id(&self) -> &str;

    async fn connection_state(&self) -> ConnectionState;

    async fn connect(&self) -> anyhow::Result<ConnectionState>;

    async fn reconnect(&self) -> anyhow::Result<ConnectionState>;

    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Send an offer and return its platform id
    async fn send_offer(&self, spec: &OfferSpec, message: &str) -> anyhow::Result<String>;

    async fn get_offer(&self, offer_id: &str) -> anyhow::Result<RemoteOffer>;

    async fn cancel_offer(&self, offer_id: &str) -> anyhow::Result<bool>;

    async fn decline_offer(&self, offer_id: &str) -> anyhow::Result<bool>;

    async fn get_inventory(&self) -> anyhow::Result<Vec<InventoryItem>>;

    /// Confirm offers waiting on mobile confirmation
    async fn confirm_pending_offers(&self) -> anyhow::Result<usize>;

    /// Accept incoming offers from other members of the pool
    async fn accept_incoming_offers(&self) -> anyhow::Result<usize>;

    /// Hold period for trading with a counterparty; [`ESCROW_UNDETERMINED`] when unknown
    async fn escrow_days(&self, counterparty_id: &str, token: &str) -> anyhow::Result<u32>;

    /// Current authenticator code
    async fn auth_code(&self) -> anyhow::Result<String>;
}

#[derive(Debug, Serialize)]
struct SendOfferRequest<'a> {
    counterparty_id: &'a str,
    token: &'a str,
    give: &'a [String],
    receive: &'a [String],
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendOfferResponse {
    offer_id: String,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    state: ConnectionState,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct EscrowResponse {
    days: u32,
}

#[derive(Debug, Deserialize)]
struct AuthCodeResponse {
    code: String,
}

/// Custodian backed by a protocol-bridge sidecar over HTTP
pub struct BridgeCustodian {
    id: String,
    client: Client,
    base_url: String,
    state: RwLock<ConnectionState>,
}

impl BridgeCustodian {
    pub fn new(id: impl Into<String>, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            id: id.into(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            state: RwLock::new(ConnectionState::Unknown),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("{} failed: {} - {}", what, status, text))
        }
    }

    async fn session_call(&self, path: &str, what: &str) -> anyhow::Result<ConnectionState> {
        let response = self.client.post(self.url(path)).send().await;
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                *self.state.write().await = ConnectionState::Error;
                return Err(e.into());
            }
        };
        let session: SessionResponse = Self::check(response, what).await?.json().await?;
        *self.state.write().await = session.state;
        info!("Custodian {} {}: {:?}", self.id, what, session.state);
        Ok(session.state)
    }

    async fn offer_action(&self, offer_id: &str, action: &str) -> anyhow::Result<bool> {
        let url = self.url(&format!("/offers/{}/{}", offer_id, action));
        let response = self.client.post(&url).send().await?;
        let body: OkResponse = Self::check(response, action).await?.json().await?;
        Ok(body.ok)
    }

    async fn count_call(&self, path: &str, what: &str) -> anyhow::Result<usize> {
        let response = self.client.post(self.url(path)).send().await?;
        let body: CountResponse = Self::check(response, what).await?.json().await?;
        if body.count > 0 {
            debug!("Custodian {} {}: {}", self.id, what, body.count);
        }
        Ok(body.count)
    }
}

#[async_trait]
impl Custodian for BridgeCustodian {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn connect(&self) -> anyhow::Result<ConnectionState> {
        self.session_call("/session/connect", "connect").await
    }

    async fn reconnect(&self) -> anyhow::Result<ConnectionState> {
        self.session_call("/session/reconnect", "reconnect").await
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.session_call("/session/disconnect", "disconnect").await?;
        Ok(())
    }

    async fn send_offer(&self, spec: &OfferSpec, message: &str) -> anyhow::Result<String> {
        let req = SendOfferRequest {
            counterparty_id: &spec.counterparty_id,
            token: &spec.token,
            give: &spec.give,
            receive: &spec.receive,
            message,
        };

        let response = self.client.post(self.url("/offers")).json(&req).send().await?;
        let body: SendOfferResponse = Self::check(response, "Send offer").await?.json().await?;
        if body.offer_id.trim().is_empty() {
            return Err(anyhow!("Send offer returned an empty offer id"));
        }
        Ok(body.offer_id)
    }

    async fn get_offer(&self, offer_id: &str) -> anyhow::Result<RemoteOffer> {
        let url = self.url(&format!("/offers/{}", offer_id));
        let response = self.client.get(&url).send().await?;
        Ok(Self::check(response, "Get offer").await?.json().await?)
    }

    async fn cancel_offer(&self, offer_id: &str) -> anyhow::Result<bool> {
        self.offer_action(offer_id, "cancel").await
    }

    async fn decline_offer(&self, offer_id: &str) -> anyhow::Result<bool> {
        self.offer_action(offer_id, "decline").await
    }

    async fn get_inventory(&self) -> anyhow::Result<Vec<InventoryItem>> {
        let response = self.client.get(self.url("/inventory")).send().await?;
        Ok(Self::check(response, "Inventory").await?.json().await?)
    }

    async fn confirm_pending_offers(&self) -> anyhow::Result<usize> {
        self.count_call("/offers/confirm", "confirmed offers").await
    }

    async fn accept_incoming_offers(&self) -> anyhow::Result<usize> {
        self.count_call("/offers/accept-incoming", "accepted incoming offers")
            .await
    }

    async fn escrow_days(&self, counterparty_id: &str, token: &str) -> anyhow::Result<u32> {
        let url = self.url(&format!("/escrow/{}", counterparty_id));
        let response = self
            .client
            .get(&url)
            .query(&[("token", token)])
            .send()
            .await?;
        let body: EscrowResponse = Self::check(response, "Escrow query").await?.json().await?;
        Ok(body.days)
    }

    async fn auth_code(&self) -> anyhow::Result<String> {
        let response = self.client.get(self.url("/auth-code")).send().await?;
        let body: AuthCodeResponse = Self::check(response, "Auth code").await?.json().await?;
        Ok(body.code)
    }
}
