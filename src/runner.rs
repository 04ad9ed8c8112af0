//! Orchestrator: shared context plus the two long-lived loops
//!
//! Intake and reconciliation run as separate tokio tasks over one
//! [`RunnerContext`]. If either loop fails, the other is stopped, an admin
//! message goes out and the error is returned to the caller.

use crate::allocation::resolve_handles;
use crate::book::{OfferBook, StorageTransfer};
use crate::config::Settings;
use crate::intake::Intake;
use crate::ledger::{ItemLedger, LedgerColumn, RowMove};
use crate::metrics::{names, MetricsCollector};
use crate::notifier::Notifier;
use crate::pool::{CustodianPool, PoolMember};
use crate::reconciler::Reconciler;
use crate::retry::{retry, RetryPolicy};
use crate::session::{LoopKind, SessionGate};
use crate::state::{NowState, StateManager};
use crate::types::{Item, ItemState, StatusUpdate};
use crate::work_queue::WorkQueue;
use crate::error::RunnerError;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything both loops and the control surface share
pub struct RunnerContext {
    pub settings: Settings,
    pub ledger: ItemLedger,
    pub pool: CustodianPool,
    pub work_queue: Arc<dyn WorkQueue>,
    pub notifier: Arc<dyn Notifier>,
    pub book: OfferBook,
    pub gate: SessionGate,
    pub metrics: MetricsCollector,
    pub state: Option<StateManager>,
    /// Held from handle resolution until the chosen handles are marked used
    pub selection: Mutex<()>,
    pub started_at: Instant,
}

impl RunnerContext {
    pub fn new(
        settings: Settings,
        ledger: ItemLedger,
        pool: CustodianPool,
        work_queue: Arc<dyn WorkQueue>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let gate = SessionGate::new(settings.timing.gate_poll());
        let state = settings.state_dir.as_deref().map(StateManager::new);
        Self {
            settings,
            ledger,
            pool,
            work_queue,
            notifier,
            book: OfferBook::new(),
            gate,
            metrics: MetricsCollector::new(),
            state,
            selection: Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Log a failed ledger write and count it
    pub async fn ledger_failure(&self, what: &str, e: impl std::fmt::Display) {
        error!("Ledger write failed ({}): {}", what, e);
        self.metrics.increment(names::LEDGER_FAILURES, 1).await;
    }

    /// Match rows to handles in `member`'s live inventory.
    ///
    /// Handles already used, or recorded on the custodian's other rows, are
    /// never handed out. Callers must hold `selection` if they go on to use
    /// the handles.
    pub async fn resolve_on(
        &self,
        member: &PoolMember,
        rows: &[Item],
    ) -> anyhow::Result<Vec<(Item, String)>> {
        let client = member.client.clone();
        let inventory = retry(self.retry_policy(), "inventory", || client.get_inventory()).await?;

        let live: Vec<String> = inventory.iter().map(|i| i.asset_handle.clone()).collect();
        let mut excluded = self.ledger.used_among(&live).await?;
        let own: HashSet<i64> = rows.iter().map(|r| r.id).collect();
        for row in self
            .ledger
            .find_by(LedgerColumn::Custodian, member.id(), None)
            .await?
        {
            if !own.contains(&row.id) && row.state != ItemState::Accepted {
                excluded.insert(row.asset_handle);
            }
        }

        Ok(resolve_handles(&inventory, rows, &excluded))
    }

    /// Settle an accepted transfer: OnHold rows still recorded under the
    /// sender move to the receiver with their new handles and become Active.
    ///
    /// Rows whose item is not yet visible in the receiver's inventory stay
    /// OnHold. Returns `true` once no row of the transfer is left pending.
    pub async fn complete_transfer(&self, transfer: &StorageTransfer) -> anyhow::Result<bool> {
        let _selection = self.selection.lock().await;

        let pending = self.held_by_sender(transfer).await?;
        if pending.is_empty() {
            return Ok(true);
        }

        let receiver = self.pool.get(&transfer.to)?;
        let resolved = self.resolve_on(receiver, &pending).await?;
        let moves: Vec<RowMove> = resolved
            .into_iter()
            .map(|(row, handle)| RowMove {
                id: row.id,
                custodian_id: transfer.to.clone(),
                asset_handle: Some(handle),
            })
            .collect();
        if !moves.is_empty() {
            self.ledger.apply_moves(&moves, ItemState::Active).await?;
        }

        if moves.len() < pending.len() {
            warn!(
                "Transfer {}: {}/{} items found in {}'s inventory, the rest stay on hold",
                transfer.offer_id,
                moves.len(),
                pending.len(),
                transfer.to
            );
            return Ok(false);
        }
        info!(
            "Transfer {} settled: {} items now held by {}",
            transfer.offer_id,
            moves.len(),
            transfer.to
        );
        Ok(true)
    }

    /// Record a transfer that will never complete. Its handles are spent, so
    /// the OnHold rows are left for an operator and only counted.
    pub async fn strand_transfer(&self, transfer: &StorageTransfer) -> anyhow::Result<usize> {
        let held = self.held_by_sender(transfer).await?;
        if held.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = held.iter().map(|r| r.id).collect();
        warn!(
            "Transfer {} failed: rows {:?} stay on hold with {}",
            transfer.offer_id, ids, transfer.from
        );
        self.metrics
            .increment(names::ITEMS_STRANDED, held.len() as u64)
            .await;
        Ok(held.len())
    }

    async fn held_by_sender(&self, transfer: &StorageTransfer) -> anyhow::Result<Vec<Item>> {
        let ids: Vec<i64> = transfer.items.iter().map(|i| i.id).collect();
        Ok(self
            .ledger
            .find_ids(&ids)
            .await?
            .into_iter()
            .filter(|r| r.state == ItemState::OnHold && r.custodian_id == transfer.from)
            .collect())
    }

    /// Withdraw an offer the ledger failed to record, so its items are not
    /// given away while the rows still read Active
    pub async fn cancel_unrecorded(&self, member: &PoolMember, offer_id: &str) {
        let client = member.client.clone();
        match retry(self.retry_policy(), "cancel offer", || client.cancel_offer(offer_id)).await {
            Ok(true) => warn!("Offer {} cancelled: ledger could not record it", offer_id),
            Ok(false) => error!("Offer {} could not be cancelled and is not in the ledger", offer_id),
            Err(e) => error!("Offer {} cancel failed and it is not in the ledger: {}", offer_id, e),
        }
        self.metrics.increment(names::OFFERS_UNRECORDED, 1).await;
    }

    /// Best-effort status callback
    pub async fn push_updates(&self, updates: &[StatusUpdate]) {
        if updates.is_empty() {
            return;
        }
        let queue = self.work_queue.clone();
        if let Err(e) = retry(self.retry_policy(), "push status", || queue.push_status(updates)).await {
            warn!("Status push for {} requests dropped: {}", updates.len(), e);
            self.metrics.increment(names::STATUS_PUSH_ERRORS, 1).await;
        }
    }

    pub async fn now_state(&self) -> NowState {
        let (online, total) = self.pool.online_count().await;
        let counts = self.book.counts().await;
        let ledger_items = match self.ledger.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!("Ledger count failed: {}", e);
                -1
            }
        };
        NowState {
            timestamp: Utc::now().to_rfc3339(),
            session: self.gate.state().to_string(),
            uptime_secs: self.uptime().as_secs(),
            custodians_online: online,
            custodians_total: total,
            queued_offers: counts.deposits_queued + counts.withdraws_queued,
            active_offers: counts.deposits_active + counts.withdraws_active,
            storage_transfers: counts.transfers,
            ledger_items,
            counters: self.metrics.snapshot().await.counters,
        }
    }

    /// Write state/now.json when a state directory is configured
    pub async fn write_snapshot(&self) {
        let Some(state) = &self.state else {
            return;
        };
        let now = self.now_state().await;
        if let Err(e) = state.write_now(&now).await {
            warn!("Failed to write runner snapshot: {}", e);
        }
    }
}

/// Runs both loops until shutdown or the first loop failure
pub struct Orchestrator {
    ctx: Arc<RunnerContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<RunnerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> Arc<RunnerContext> {
        self.ctx.clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), RunnerError> {
        if let Some(state) = &self.ctx.state {
            if let Err(e) = state.init().await {
                warn!("State directory unavailable: {}", e);
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut intake = spawn_loop(self.ctx.clone(), LoopKind::Intake, stop_rx.clone());
        let mut reconcile = spawn_loop(self.ctx.clone(), LoopKind::Reconcile, stop_rx);
        info!("Orchestrator started");

        let first = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => None,
            res = &mut intake => Some((LoopKind::Intake, res)),
            res = &mut reconcile => Some((LoopKind::Reconcile, res)),
        };

        let Some((failed, outcome)) = first else {
            info!("Shutdown requested");
            let _ = stop_tx.send(true);
            let _ = intake.await;
            let _ = reconcile.await;
            return Ok(());
        };
        let other = match failed {
            LoopKind::Intake => reconcile,
            LoopKind::Reconcile => intake,
        };

        let reason = match outcome {
            Ok(Ok(())) => "exited".to_string(),
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) => format!("task aborted: {}", e),
        };
        error!("{} loop stopped: {}", failed, reason);
        self.ctx.gate.mark_idle(failed);
        self.ctx
            .notifier
            .post_message(&format!("{} loop has exited: {}", failed, reason))
            .await;

        let _ = stop_tx.send(true);
        let _ = other.await;

        Err(RunnerError::LoopFailed {
            loop_name: match failed {
                LoopKind::Intake => "intake",
                LoopKind::Reconcile => "reconcile",
            },
            reason,
        })
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Sender gone without a signal: run until a loop stops
            std::future::pending::<()>().await;
        }
    }
}

fn spawn_loop(
    ctx: Arc<RunnerContext>,
    kind: LoopKind,
    stop: watch::Receiver<bool>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let result = run_loop(ctx.clone(), kind, stop).await;
        ctx.gate.mark_idle(kind);
        result
    })
}

async fn run_loop(
    ctx: Arc<RunnerContext>,
    kind: LoopKind,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let intake = Intake::new(ctx.clone());
    let reconciler = Reconciler::new(ctx.clone());
    let interval = match kind {
        LoopKind::Intake => ctx.settings.timing.intake_interval(),
        LoopKind::Reconcile => ctx.settings.timing.reconcile_interval(),
    };
    info!("{} loop running every {:?}", kind, interval);

    loop {
        if !ctx.gate.wait_runnable(kind, &mut stop).await {
            info!("{} loop stopping", kind);
            return Ok(());
        }

        match kind {
            LoopKind::Intake => {
                intake.run_cycle().await?;
            }
            LoopKind::Reconcile => {
                reconciler.run_cycle().await?;
            }
        }

        ctx.gate.mark_idle(kind);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => {}
        }
    }
}
