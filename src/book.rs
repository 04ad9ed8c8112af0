//! In-flight offer book
//!
//! Intake is the only producer into `queued`; reconciliation promotes queued
//! offers into `active` and retires them. The control surface only mutates
//! the book after locking the session.

use crate::types::{Item, TradeKind, TradeRequest};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A user offer waiting for the counterparty
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOffer {
    pub request: TradeRequest,
    pub offer_id: String,
    pub sent_at: DateTime<Utc>,
}

impl TrackedOffer {
    pub fn new(request: TradeRequest, offer_id: impl Into<String>) -> Self {
        Self {
            request,
            offer_id: offer_id.into(),
            sent_at: Utc::now(),
        }
    }
}

/// A rebalance offer from the coordinator to a storage custodian
#[derive(Debug, Clone, PartialEq)]
pub struct StorageTransfer {
    pub transfer_id: Uuid,
    pub offer_id: String,
    pub from: String,
    pub to: String,
    pub items: Vec<Item>,
    pub sent_at: DateTime<Utc>,
    pub error_count: u32,
}

impl StorageTransfer {
    pub fn new(offer_id: impl Into<String>, from: impl Into<String>, to: impl Into<String>, items: Vec<Item>) -> Self {
        Self {
            transfer_id: Uuid::new_v4(),
            offer_id: offer_id.into(),
            from: from.into(),
            to: to.into(),
            items,
            sent_at: Utc::now(),
            error_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookCounts {
    pub deposits_active: usize,
    pub withdraws_active: usize,
    pub deposits_queued: usize,
    pub withdraws_queued: usize,
    pub transfers: usize,
    pub deferred: usize,
}

#[derive(Default)]
pub struct OfferBook {
    queued: Mutex<Vec<TrackedOffer>>,
    active: Mutex<Vec<TrackedOffer>>,
    transfers: Mutex<Vec<StorageTransfer>>,
    deferred: Mutex<Vec<TradeRequest>>,
}

impl OfferBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue(&self, offer: TrackedOffer) {
        self.queued.lock().await.push(offer);
    }

    /// Move every queued offer into the active set
    pub async fn promote(&self) -> usize {
        let mut queued = self.queued.lock().await;
        let moved = queued.len();
        if moved > 0 {
            self.active.lock().await.extend(queued.drain(..));
        }
        moved
    }

    pub async fn active_snapshot(&self) -> Vec<TrackedOffer> {
        self.active.lock().await.clone()
    }

    /// Drop active offers whose offer id is in `offer_ids`
    pub async fn retire(&self, offer_ids: &HashSet<String>) {
        if offer_ids.is_empty() {
            return;
        }
        self.active
            .lock()
            .await
            .retain(|o| !offer_ids.contains(&o.offer_id));
    }

    pub async fn bump_error(&self, offer_id: &str) {
        let mut active = self.active.lock().await;
        if let Some(offer) = active.iter_mut().find(|o| o.offer_id == offer_id) {
            offer.request.error_count += 1;
        }
    }

    /// Whether a request is already queued or active
    pub async fn is_in_flight(&self, request_id: &str) -> bool {
        let in_queue = self
            .queued
            .lock()
            .await
            .iter()
            .any(|o| o.request.request_id == request_id);
        in_queue
            || self
                .active
                .lock()
                .await
                .iter()
                .any(|o| o.request.request_id == request_id)
    }

    pub async fn defer(&self, request: TradeRequest) {
        let mut deferred = self.deferred.lock().await;
        deferred.retain(|r| r.request_id != request.request_id);
        deferred.push(request);
    }

    pub async fn take_deferred(&self) -> Vec<TradeRequest> {
        std::mem::take(&mut *self.deferred.lock().await)
    }

    pub async fn add_transfer(&self, transfer: StorageTransfer) {
        self.transfers.lock().await.push(transfer);
    }

    pub async fn transfers_snapshot(&self) -> Vec<StorageTransfer> {
        self.transfers.lock().await.clone()
    }

    pub async fn retire_transfers(&self, transfer_ids: &HashSet<Uuid>) {
        if transfer_ids.is_empty() {
            return;
        }
        self.transfers
            .lock()
            .await
            .retain(|t| !transfer_ids.contains(&t.transfer_id));
    }

    pub async fn bump_transfer_error(&self, transfer_id: Uuid) {
        let mut transfers = self.transfers.lock().await;
        if let Some(t) = transfers.iter_mut().find(|t| t.transfer_id == transfer_id) {
            t.error_count += 1;
        }
    }

    /// Remove queued and active offers for a request; returns how many went
    pub async fn remove_by_request(&self, request_id: &str) -> usize {
        let mut removed = 0;
        {
            let mut queued = self.queued.lock().await;
            let before = queued.len();
            queued.retain(|o| o.request.request_id != request_id);
            removed += before - queued.len();
        }
        let mut active = self.active.lock().await;
        let before = active.len();
        active.retain(|o| o.request.request_id != request_id);
        removed + (before - active.len())
    }

    /// Empty the queued and active sets
    pub async fn clear(&self) -> usize {
        let mut queued = self.queued.lock().await;
        let mut active = self.active.lock().await;
        let dropped = queued.len() + active.len();
        queued.clear();
        active.clear();
        dropped
    }

    pub async fn counts(&self) -> BookCounts {
        let count = |offers: &[TrackedOffer], kind: TradeKind| {
            offers.iter().filter(|o| o.request.kind == kind).count()
        };

        let queued = self.queued.lock().await;
        let active = self.active.lock().await;
        BookCounts {
            deposits_active: count(&active, TradeKind::Deposit),
            withdraws_active: count(&active, TradeKind::Withdraw),
            deposits_queued: count(&queued, TradeKind::Deposit),
            withdraws_queued: count(&queued, TradeKind::Withdraw),
            transfers: self.transfers.lock().await.len(),
            deferred: self.deferred.lock().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(kind: TradeKind, request_id: &str, offer_id: &str) -> TrackedOffer {
        TrackedOffer::new(
            TradeRequest::new(kind, request_id, "76561198000000000", "tok", "sec", vec![]),
            offer_id,
        )
    }

    #[tokio::test]
    async fn test_promote_and_retire() {
        let book = OfferBook::new();
        book.enqueue(offer(TradeKind::Deposit, "q1", "o1")).await;
        book.enqueue(offer(TradeKind::Withdraw, "q2", "o2")).await;

        assert!(book.is_in_flight("q1").await);
        assert_eq!(book.counts().await.deposits_queued, 1);

        assert_eq!(book.promote().await, 2);
        let counts = book.counts().await;
        assert_eq!(counts.deposits_active, 1);
        assert_eq!(counts.withdraws_active, 1);
        assert_eq!(counts.deposits_queued, 0);

        book.bump_error("o2").await;
        let done: HashSet<String> = ["o1".to_string()].into_iter().collect();
        book.retire(&done).await;

        let active = book.active_snapshot().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].request.error_count, 1);
        assert!(!book.is_in_flight("q1").await);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let book = OfferBook::new();
        book.enqueue(offer(TradeKind::Deposit, "q1", "o1")).await;
        book.promote().await;
        book.enqueue(offer(TradeKind::Deposit, "q1", "o3")).await;
        book.enqueue(offer(TradeKind::Withdraw, "q2", "o2")).await;

        assert_eq!(book.remove_by_request("q1").await, 2);
        assert_eq!(book.clear().await, 1);
        assert_eq!(book.counts().await, BookCounts::default());
    }

    #[tokio::test]
    async fn test_defer_replaces_same_request() {
        let book = OfferBook::new();
        let mut first = offer(TradeKind::Withdraw, "q1", "").request;
        book.defer(first.clone()).await;
        first.error_count = 2;
        book.defer(first).await;

        let deferred = book.take_deferred().await;
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].error_count, 2);
        assert!(book.take_deferred().await.is_empty());
    }
}
