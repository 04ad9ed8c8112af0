//! External work queue: pending requests in, status callbacks out

use crate::config::WorkQueueSettings;
use crate::types::{RequestedItem, StatusUpdate, TradeKind, TradeRequest};
use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Pending deposits and withdraws, deposits first
    async fn fetch_pending(&self) -> anyhow::Result<Vec<TradeRequest>>;

    async fn push_status(&self, updates: &[StatusUpdate]) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct PendingPayload {
    #[serde(rename = "Deposits", default)]
    deposits: Option<Vec<WireRequest>>,
    #[serde(rename = "withdrawal", default)]
    withdrawals: Option<Vec<WireRequest>>,
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(rename = "SteamId", deserialize_with = "string_or_number")]
    counterparty_id: String,
    #[serde(rename = "QueId", deserialize_with = "string_or_number")]
    queue_id: String,
    #[serde(rename = "SecurityToken", default)]
    security_token: Option<String>,
    #[serde(rename = "RU_Token", default)]
    token: Option<String>,
    #[serde(rename = "item_Ids", default)]
    item_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct StatusPayload<'a> {
    #[serde(rename = "Trades")]
    trades: &'a [StatusUpdate],
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

impl WireRequest {
    fn into_request(self, kind: TradeKind) -> TradeRequest {
        let raw_items = self.item_ids.unwrap_or_default();
        let mut requested = Vec::with_capacity(raw_items.len());
        for raw in &raw_items {
            match RequestedItem::parse(raw) {
                Some(item) => requested.push(item),
                None => warn!("Request {}: skipping unparsable item '{}'", self.queue_id, raw),
            }
        }

        TradeRequest::new(
            kind,
            self.queue_id,
            self.counterparty_id,
            self.token.unwrap_or_default(),
            self.security_token.unwrap_or_default(),
            requested,
        )
    }
}

/// Parse a pending-work document. An empty body means no work.
pub fn parse_pending(body: &str) -> anyhow::Result<Vec<TradeRequest>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }

    let payload: PendingPayload = serde_json::from_str(body)?;
    let deposits = payload
        .deposits
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.into_request(TradeKind::Deposit));
    let withdrawals = payload
        .withdrawals
        .unwrap_or_default()
        .into_iter()
        .map(|r| r.into_request(TradeKind::Withdraw));

    Ok(deposits.chain(withdrawals).collect())
}

/// Work queue reached over HTTP
pub struct HttpWorkQueue {
    client: Client,
    fetch_url: String,
    callback_url: String,
}

impl HttpWorkQueue {
    pub fn new(settings: &WorkQueueSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            fetch_url: settings.fetch_url.clone(),
            callback_url: settings.callback_url.clone(),
        })
    }
}

#[async_trait]
impl WorkQueue for HttpWorkQueue {
    async fn fetch_pending(&self) -> anyhow::Result<Vec<TradeRequest>> {
        let response = self.client.get(&self.fetch_url).send().await?;

        if response.status().is_success() {
            let body = response.text().await?;
            let requests = parse_pending(&body)?;
            debug!("Fetched {} pending requests", requests.len());
            Ok(requests)
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("Fetch pending failed: {} - {}", status, text))
        }
    }

    async fn push_status(&self, updates: &[StatusUpdate]) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let json = serde_json::to_string(&StatusPayload { trades: updates })?;
        let response = self
            .client
            .post(&self.callback_url)
            .form(&[("action", "invtradecallback"), ("Status", json.as_str())])
            .send()
            .await?;

        if response.status().is_success() {
            debug!("Pushed {} status updates", updates.len());
            Ok(())
        } else {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Err(anyhow!("Status push failed: {} - {}", status, text))
        }
    }
}
