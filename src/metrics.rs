//! In-process counters for the orchestrator

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Counter collector shared by both loops and the control surface
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: BTreeMap<String, u64>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: BTreeMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    /// Increment a counter
    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        MetricsSnapshot {
            counters: inner.counters.clone(),
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub uptime_secs: u64,
}

/// Predefined counter names
pub mod names {
    // User offers
    pub const OFFERS_SENT: &str = "offers_sent_total";
    pub const OFFERS_ACCEPTED: &str = "offers_accepted_total";
    pub const OFFERS_DECLINED: &str = "offers_declined_total";
    pub const OFFERS_EXPIRED: &str = "offers_expired_total";
    pub const OFFER_POLL_ERRORS: &str = "offer_poll_errors_total";

    // Intake
    pub const REQUESTS_DEFERRED: &str = "requests_deferred_total";
    pub const ESCROW_REJECTED: &str = "escrow_rejected_total";

    // Ledger
    pub const LEDGER_FAILURES: &str = "ledger_failures_total";
    /// Rows left Sent or OnHold after their offer failed
    pub const ITEMS_STRANDED: &str = "stranded_items_total";
    /// Offers cancelled because the ledger could not record them
    pub const OFFERS_UNRECORDED: &str = "offers_unrecorded_total";

    // Storage
    pub const CONSOLIDATION_TRANSFERS: &str = "consolidation_transfers_total";
    pub const REBALANCE_TRANSFERS: &str = "rebalance_transfers_total";

    // Work queue
    pub const STATUS_PUSH_ERRORS: &str = "status_push_errors_total";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.increment(names::OFFERS_SENT, 1).await;
        metrics.increment(names::OFFERS_SENT, 2).await;

        assert_eq!(metrics.get_counter(names::OFFERS_SENT).await, 3);
        assert_eq!(metrics.get_counter(names::OFFERS_DECLINED).await, 0);

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.counters.get(names::OFFERS_SENT), Some(&3));
    }
}
