//! In-memory trading platform, custodians and work queue for testing without a bridge
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use custody_runner::{
    types::{StatusUpdate, TradeRequest},
    Custodian, ConnectionState, InventoryItem, Notifier, OfferSpec, OfferState, RemoteOffer,
    WorkQueue,
};
use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// One offer as the platform sees it
#[derive(Debug, Clone)]
pub struct MockOffer {
    pub offer_id: String,
    pub from: String,
    pub to: String,
    pub give: Vec<String>,
    pub receive: Vec<String>,
    pub message: String,
    pub state: OfferState,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct PlatformState {
    inventories: HashMap<String, Vec<InventoryItem>>,
    offers: HashMap<String, MockOffer>,
    offer_order: Vec<String>,
    escrow: HashMap<String, u32>,
    escrow_failures: usize,
    send_failures: usize,
    inventory_failures: usize,
    pool: HashSet<String>,
    next_offer: u64,
    next_handle: u64,
}

/// Shared platform state; every handle change on a transfer mirrors a real trade
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let state = PlatformState {
            next_offer: 1,
            next_handle: 90_000,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A custodian of the pool; offers between pool members are accepted by `accept_incoming_offers`
    pub fn custodian(&self, id: &str) -> Arc<MockCustodian> {
        self.state.lock().unwrap().pool.insert(id.to_string());
        Arc::new(MockCustodian {
            id: id.to_string(),
            platform: self.clone(),
            state: Mutex::new(ConnectionState::Disconnected),
        })
    }

    pub fn give(&self, owner: &str, handle: &str, type_id: &str) {
        self.state
            .lock()
            .unwrap()
            .inventories
            .entry(owner.to_string())
            .or_default()
            .push(InventoryItem::new(handle, type_id));
    }

    pub fn inventory(&self, owner: &str) -> Vec<InventoryItem> {
        self.state
            .lock()
            .unwrap()
            .inventories
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_escrow(&self, counterparty: &str, days: u32) {
        self.state
            .lock()
            .unwrap()
            .escrow
            .insert(counterparty.to_string(), days);
    }

    pub fn fail_next_escrow_queries(&self, n: usize) {
        self.state.lock().unwrap().escrow_failures = n;
    }

    pub fn fail_next_sends(&self, n: usize) {
        self.state.lock().unwrap().send_failures = n;
    }

    pub fn fail_next_inventory_reads(&self, n: usize) {
        self.state.lock().unwrap().inventory_failures = n;
    }

    pub fn offers(&self) -> Vec<MockOffer> {
        let state = self.state.lock().unwrap();
        state
            .offer_order
            .iter()
            .filter_map(|id| state.offers.get(id).cloned())
            .collect()
    }

    pub fn offers_to(&self, to: &str) -> Vec<MockOffer> {
        self.offers().into_iter().filter(|o| o.to == to).collect()
    }

    pub fn offer(&self, offer_id: &str) -> Option<MockOffer> {
        self.state.lock().unwrap().offers.get(offer_id).cloned()
    }

    pub fn set_state(&self, offer_id: &str, state: OfferState) {
        if let Some(offer) = self.state.lock().unwrap().offers.get_mut(offer_id) {
            offer.state = state;
        }
    }

    pub fn age_offer(&self, offer_id: &str, secs: i64) {
        if let Some(offer) = self.state.lock().unwrap().offers.get_mut(offer_id) {
            offer.created_at = Utc::now() - ChronoDuration::seconds(secs);
        }
    }

    /// The counterparty accepts: items change hands and get fresh handles
    pub fn accept(&self, offer_id: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(offer) = state.offers.get(offer_id).cloned() else {
            return;
        };
        if offer.state != OfferState::Active {
            return;
        }
        move_items(&mut state, &offer.from, &offer.to, &offer.give);
        move_items(&mut state, &offer.to, &offer.from, &offer.receive);
        if let Some(offer) = state.offers.get_mut(offer_id) {
            offer.state = OfferState::Accepted;
        }
    }
}

fn move_items(state: &mut PlatformState, from: &str, to: &str, handles: &[String]) {
    for handle in handles {
        let source = state.inventories.entry(from.to_string()).or_default();
        let Some(pos) = source.iter().position(|i| &i.asset_handle == handle) else {
            continue;
        };
        let item = source.remove(pos);
        let fresh = state.next_handle.to_string();
        state.next_handle += 1;
        state
            .inventories
            .entry(to.to_string())
            .or_default()
            .push(InventoryItem::new(fresh, item.type_id));
    }
}

pub struct MockCustodian {
    id: String,
    platform: MockPlatform,
    state: Mutex<ConnectionState>,
}

#[async_trait]
impl Custodian for MockCustodian {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connection_state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    async fn connect(&self) -> anyhow::Result<ConnectionState> {
        *self.state.lock().unwrap() = ConnectionState::Connected;
        Ok(ConnectionState::Connected)
    }

    async fn reconnect(&self) -> anyhow::Result<ConnectionState> {
        self.connect().await
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send_offer(&self, spec: &OfferSpec, message: &str) -> anyhow::Result<String> {
        let mut state = self.platform.state.lock().unwrap();
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(anyhow!("send offer failed: 500 - platform busy"));
        }

        let own = state.inventories.get(&self.id).cloned().unwrap_or_default();
        for handle in &spec.give {
            if !own.iter().any(|i| &i.asset_handle == handle) {
                return Err(anyhow!("send offer failed: {} not in inventory", handle));
            }
        }

        let offer_id = format!("offer-{}", state.next_offer);
        state.next_offer += 1;
        state.offers.insert(
            offer_id.clone(),
            MockOffer {
                offer_id: offer_id.clone(),
                from: self.id.clone(),
                to: spec.counterparty_id.clone(),
                give: spec.give.clone(),
                receive: spec.receive.clone(),
                message: message.to_string(),
                state: OfferState::Active,
                created_at: Utc::now(),
            },
        );
        state.offer_order.push(offer_id.clone());
        Ok(offer_id)
    }

    async fn get_offer(&self, offer_id: &str) -> anyhow::Result<RemoteOffer> {
        let state = self.platform.state.lock().unwrap();
        let offer = state
            .offers
            .get(offer_id)
            .filter(|o| o.from == self.id)
            .ok_or_else(|| anyhow!("get offer failed: 404 - {}", offer_id))?;
        Ok(RemoteOffer {
            offer_id: offer.offer_id.clone(),
            state: offer.state,
            created_at: offer.created_at,
        })
    }

    async fn cancel_offer(&self, offer_id: &str) -> anyhow::Result<bool> {
        let mut state = self.platform.state.lock().unwrap();
        match state.offers.get_mut(offer_id) {
            Some(offer) if offer.state == OfferState::Active => {
                offer.state = OfferState::Canceled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn decline_offer(&self, offer_id: &str) -> anyhow::Result<bool> {
        let mut state = self.platform.state.lock().unwrap();
        match state.offers.get_mut(offer_id) {
            Some(offer) => {
                offer.state = OfferState::Declined;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_inventory(&self) -> anyhow::Result<Vec<InventoryItem>> {
        {
            let mut state = self.platform.state.lock().unwrap();
            if state.inventory_failures > 0 {
                state.inventory_failures -= 1;
                return Err(anyhow!("inventory failed: 503 - rate limited"));
            }
        }
        Ok(self.platform.inventory(&self.id))
    }

    async fn confirm_pending_offers(&self) -> anyhow::Result<usize> {
        Ok(0)
    }

    async fn accept_incoming_offers(&self) -> anyhow::Result<usize> {
        let incoming: Vec<String> = {
            let state = self.platform.state.lock().unwrap();
            state
                .offer_order
                .iter()
                .filter_map(|id| state.offers.get(id))
                .filter(|o| o.to == self.id && o.state == OfferState::Active && state.pool.contains(&o.from))
                .map(|o| o.offer_id.clone())
                .collect()
        };
        for offer_id in &incoming {
            self.platform.accept(offer_id);
        }
        Ok(incoming.len())
    }

    async fn escrow_days(&self, counterparty_id: &str, _token: &str) -> anyhow::Result<u32> {
        let mut state = self.platform.state.lock().unwrap();
        if state.escrow_failures > 0 {
            state.escrow_failures -= 1;
            return Err(anyhow!("escrow query failed: 502 - bad gateway"));
        }
        Ok(state.escrow.get(counterparty_id).copied().unwrap_or(0))
    }

    async fn auth_code(&self) -> anyhow::Result<String> {
        Ok(format!("{}-CODE", self.id.to_uppercase()))
    }
}

/// Work queue that keeps handing out a request until a status for it is pushed
#[derive(Default)]
pub struct MockWorkQueue {
    pending: Mutex<Vec<TradeRequest>>,
    pushed: Mutex<Vec<StatusUpdate>>,
}

impl MockWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, request: TradeRequest) {
        self.pending.lock().unwrap().push(request);
    }

    pub fn pushed(&self) -> Vec<StatusUpdate> {
        self.pushed.lock().unwrap().clone()
    }

    /// Status codes pushed for one request, oldest first
    pub fn codes_for(&self, request_id: &str) -> Vec<u8> {
        self.pushed()
            .iter()
            .filter(|u| u.request_id == request_id)
            .map(|u| u.status.code())
            .collect()
    }
}

#[async_trait]
impl WorkQueue for MockWorkQueue {
    async fn fetch_pending(&self) -> anyhow::Result<Vec<TradeRequest>> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn push_status(&self, updates: &[StatusUpdate]) -> anyhow::Result<()> {
        let ids: HashSet<&str> = updates.iter().map(|u| u.request_id.as_str()).collect();
        self.pending
            .lock()
            .unwrap()
            .retain(|r| !ids.contains(r.request_id.as_str()));
        self.pushed.lock().unwrap().extend_from_slice(updates);
        Ok(())
    }
}

/// Notifier that keeps every message
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn post_message(&self, text: &str) {
        self.messages.lock().unwrap().push(text.to_string());
    }
}
