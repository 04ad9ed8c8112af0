//! Reconciliation loop
//!
//! Polls every in-flight user offer and storage transfer, applies the ledger
//! transitions their outcome calls for, and moves surplus coordinator stock
//! to storage custodians.

use crate::book::{StorageTransfer, TrackedOffer};
use crate::ledger::{LedgerColumn, RowMove};
use crate::metrics::names;
use crate::retry::retry;
use crate::runner::RunnerContext;
use crate::types::{ItemState, NewItem, OfferSpec, OfferState, Phase, StatusUpdate, TradeKind};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub accepted: usize,
    pub declined: usize,
    pub expired: usize,
    pub pending: usize,
    pub transfers_settled: usize,
    pub rebalanced: bool,
}

/// Outcome of polling one user offer
enum Verdict {
    /// Retire and report
    Done(StatusUpdate),
    /// Leave in flight
    Pending,
}

pub struct Reconciler {
    ctx: Arc<RunnerContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<RunnerContext>) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self) -> anyhow::Result<ReconcileReport> {
        let ctx = &self.ctx;
        let mut report = ReconcileReport::default();

        let promoted = ctx.book.promote().await;
        if promoted > 0 {
            debug!("Promoted {} queued offers", promoted);
        }

        let mut retired: HashSet<String> = HashSet::new();
        let mut updates: Vec<StatusUpdate> = Vec::new();

        for offer in ctx.book.active_snapshot().await {
            match self.check_offer(&offer, &mut report).await {
                Verdict::Done(update) => {
                    retired.insert(offer.offer_id.clone());
                    updates.push(update);
                }
                Verdict::Pending => report.pending += 1,
            }
        }
        ctx.book.retire(&retired).await;

        report.transfers_settled = self.check_transfers().await;

        match self.rebalance().await {
            Ok(sent) => report.rebalanced = sent,
            Err(e) => warn!("Rebalance skipped: {:#}", e),
        }

        ctx.push_updates(&updates).await;
        ctx.write_snapshot().await;

        if report.accepted + report.declined + report.expired > 0 {
            info!(
                "Reconcile cycle: {} accepted, {} declined, {} expired, {} pending",
                report.accepted, report.declined, report.expired, report.pending
            );
        }
        Ok(report)
    }

    async fn check_offer(&self, offer: &TrackedOffer, report: &mut ReconcileReport) -> Verdict {
        let ctx = &self.ctx;
        let coordinator = ctx.pool.coordinator().client.clone();
        let request = &offer.request;

        let remote = match retry(ctx.retry_policy(), "poll offer", || coordinator.get_offer(&offer.offer_id)).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Offer {} poll failed: {}", offer.offer_id, e);
                self.count_poll_error(&offer.offer_id).await;
                return Verdict::Pending;
            }
        };
        debug!("Offer {} ({} to {}): {:?}", offer.offer_id, request.kind, request.counterparty_id, remote.state);

        let mut finished = request.clone();
        finished.offer_id = Some(offer.offer_id.clone());

        match remote.state {
            OfferState::Accepted => {
                let committed = match request.kind {
                    TradeKind::Deposit => self.record_deposit(offer).await,
                    TradeKind::Withdraw => {
                        let ids: Vec<i64> = request.resolved.iter().map(|i| i.id).collect();
                        match ctx.ledger.update_state(&ids, ItemState::Accepted).await {
                            Ok(()) => true,
                            Err(e) => {
                                ctx.ledger_failure("withdraw rows to accepted", e).await;
                                false
                            }
                        }
                    }
                };
                if !committed {
                    // Retried next cycle; never reported before the ledger has it
                    return Verdict::Pending;
                }

                info!("{} offer {} accepted by {}", request.kind, offer.offer_id, request.counterparty_id);
                ctx.metrics.increment(names::OFFERS_ACCEPTED, 1).await;
                report.accepted += 1;
                finished.set_phase(Phase::Accepted);
                Verdict::Done(finished.status_update())
            }
            OfferState::Active => {
                let age = Utc::now().signed_duration_since(remote.created_at);
                let expired = request.kind == TradeKind::Deposit
                    && age.num_seconds() > ctx.settings.timing.offer_expiry_secs as i64;
                if !expired {
                    return Verdict::Pending;
                }

                info!("Deposit offer {} is {}s old, cancelling", offer.offer_id, age.num_seconds());
                match retry(ctx.retry_policy(), "cancel offer", || coordinator.cancel_offer(&offer.offer_id)).await {
                    Ok(cancelled) => info!("Offer {} cancelled: {}", offer.offer_id, cancelled),
                    Err(e) => warn!("Offer {} cancel failed: {}", offer.offer_id, e),
                }
                ctx.metrics.increment(names::OFFERS_EXPIRED, 1).await;
                report.expired += 1;
                finished.set_phase(Phase::Declined);
                Verdict::Done(finished.status_update())
            }
            state if state.is_failed() => {
                if state == OfferState::Countered {
                    match retry(ctx.retry_policy(), "decline offer", || coordinator.decline_offer(&offer.offer_id)).await {
                        Ok(declined) => info!("Countered offer {} declined: {}", offer.offer_id, declined),
                        Err(e) => warn!("Countered offer {} decline failed: {}", offer.offer_id, e),
                    }
                }
                if request.kind == TradeKind::Withdraw && !request.resolved.is_empty() {
                    // Their handles are spent; the rows stay Sent until an operator steps in
                    let ids: Vec<i64> = request.resolved.iter().map(|i| i.id).collect();
                    warn!("Withdraw offer {} failed: rows {:?} stay sent", offer.offer_id, ids);
                    ctx.metrics
                        .increment(names::ITEMS_STRANDED, ids.len() as u64)
                        .await;
                }

                info!("{} offer {} ended as {:?}", request.kind, offer.offer_id, state);
                ctx.metrics.increment(names::OFFERS_DECLINED, 1).await;
                report.declined += 1;
                finished.set_phase(Phase::Declined);
                Verdict::Done(finished.status_update())
            }
            _ => {
                self.count_poll_error(&offer.offer_id).await;
                Verdict::Pending
            }
        }
    }

    async fn count_poll_error(&self, offer_id: &str) {
        self.ctx.book.bump_error(offer_id).await;
        self.ctx.metrics.increment(names::OFFER_POLL_ERRORS, 1).await;
    }

    /// Insert rows for an accepted deposit; `false` when the ledger write failed
    async fn record_deposit(&self, offer: &TrackedOffer) -> bool {
        let ctx = &self.ctx;
        let coordinator = ctx.pool.coordinator();
        let rows: Vec<NewItem> = offer
            .request
            .requested
            .iter()
            .map(|item| NewItem {
                custodian_id: coordinator.id().to_string(),
                asset_handle: item.asset_handle.clone(),
                type_id: item.type_id.clone(),
            })
            .collect();

        let inserted = match ctx.ledger.insert_rows(&rows).await {
            Ok(inserted) => inserted,
            Err(e) => {
                ctx.ledger_failure("deposit rows", e).await;
                return false;
            }
        };
        info!("{} deposited items recorded", inserted.len());

        // Swap the counterparty's handles for the ones the coordinator now holds
        let _selection = ctx.selection.lock().await;
        match ctx.resolve_on(coordinator, &inserted).await {
            Ok(resolved) => {
                let moves: Vec<_> = resolved
                    .into_iter()
                    .map(|(row, handle)| RowMove {
                        id: row.id,
                        custodian_id: row.custodian_id,
                        asset_handle: Some(handle),
                    })
                    .collect();
                if let Err(e) = ctx.ledger.apply_moves(&moves, ItemState::Active).await {
                    ctx.ledger_failure("deposit handles", e).await;
                }
            }
            Err(e) => warn!("Deposit handles not refreshed: {}", e),
        }
        true
    }

    /// Poll in-flight storage transfers; returns how many settled
    async fn check_transfers(&self) -> usize {
        let ctx = &self.ctx;
        let mut done: HashSet<Uuid> = HashSet::new();
        let mut settled = 0;

        for transfer in ctx.book.transfers_snapshot().await {
            match self.check_transfer(&transfer).await {
                Ok(true) => {
                    done.insert(transfer.transfer_id);
                    settled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Transfer {} check failed: {:#}", transfer.offer_id, e);
                    ctx.book.bump_transfer_error(transfer.transfer_id).await;
                }
            }
        }

        ctx.book.retire_transfers(&done).await;
        settled
    }

    /// `Ok(true)` once the transfer is finished either way
    async fn check_transfer(&self, transfer: &StorageTransfer) -> anyhow::Result<bool> {
        let ctx = &self.ctx;
        let sender = ctx.pool.get(&transfer.from)?.client.clone();
        let receiver = ctx.pool.get(&transfer.to)?.client.clone();

        if let Err(e) = retry(ctx.retry_policy(), "accept incoming", || receiver.accept_incoming_offers()).await {
            warn!("Custodian {} could not accept incoming offers: {}", transfer.to, e);
        }

        let remote = retry(ctx.retry_policy(), "poll transfer", || sender.get_offer(&transfer.offer_id)).await?;
        match remote.state {
            OfferState::Accepted => ctx.complete_transfer(transfer).await,
            state if state.is_failed() => {
                ctx.strand_transfer(transfer).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Move surplus coordinator stock to one storage custodian. Returns whether an offer went out.
    async fn rebalance(&self) -> anyhow::Result<bool> {
        let ctx = &self.ctx;
        let limits = &ctx.settings.storage;
        let coordinator = ctx.pool.coordinator();

        let _selection = ctx.selection.lock().await;
        let held = ctx
            .ledger
            .find_by(LedgerColumn::Custodian, coordinator.id(), Some(ItemState::Active))
            .await?;
        if held.len() < limits.host_item_limit {
            return Ok(false);
        }
        info!("Coordinator holds {} items, moving some to storage", held.len());

        for member in ctx.pool.storage() {
            let client = member.client.clone();
            let inventory = match retry(ctx.retry_policy(), "inventory", || client.get_inventory()).await {
                Ok(inventory) => inventory,
                Err(e) => {
                    warn!("Storage custodian {} inventory unavailable: {}", member.settings.display_name(), e);
                    continue;
                }
            };
            if inventory.len() >= limits.item_limit_per_custodian {
                continue;
            }

            let slots = (limits.item_limit_per_custodian - inventory.len()).min(limits.max_batch_size);
            let recorded: Vec<String> = held.iter().map(|r| r.asset_handle.clone()).collect();
            let used = ctx.ledger.used_among(&recorded).await?;
            let candidates: Vec<_> = held
                .iter()
                .filter(|r| !used.contains(&r.asset_handle))
                .take(slots)
                .cloned()
                .collect();
            let resolved = ctx.resolve_on(coordinator, &candidates).await?;
            if resolved.is_empty() {
                warn!("No coordinator items could be matched to live handles");
                return Ok(false);
            }

            let handles: Vec<String> = resolved.iter().map(|(_, h)| h.clone()).collect();
            let spec = OfferSpec {
                counterparty_id: member.id().to_string(),
                token: member.settings.trade_token.clone(),
                give: handles.clone(),
                receive: Vec::new(),
            };
            let sender = coordinator.client.clone();
            let message = ctx.settings.storage_message.clone();
            let offer_id = match retry(ctx.retry_policy(), "storage offer", || sender.send_offer(&spec, &message)).await {
                Ok(offer_id) => offer_id,
                Err(e) => {
                    error!("Storage offer to {} not sent: {}", member.settings.display_name(), e);
                    return Ok(false);
                }
            };
            info!(
                "Storage offer {} sent to {} with {} items",
                offer_id,
                member.settings.display_name(),
                handles.len()
            );

            let moves: Vec<RowMove> = resolved
                .iter()
                .map(|(row, handle)| RowMove {
                    id: row.id,
                    custodian_id: coordinator.id().to_string(),
                    asset_handle: Some(handle.clone()),
                })
                .collect();
            if let Err(e) = ctx.ledger.commit_offer(&handles, &moves, ItemState::OnHold).await {
                ctx.ledger_failure("storage rows to on_hold", e).await;
                ctx.cancel_unrecorded(coordinator, &offer_id).await;
                return Ok(false);
            }
            let rows: Vec<_> = resolved.into_iter().map(|(row, _)| row).collect();

            ctx.book
                .add_transfer(StorageTransfer::new(offer_id, coordinator.id(), member.id(), rows))
                .await;
            ctx.metrics.increment(names::REBALANCE_TRANSFERS, 1).await;
            return Ok(true);
        }

        Ok(false)
    }
}
