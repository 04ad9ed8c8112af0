//! Intake loop: pending requests become user offers
//!
//! Per request: escrow check, then either a deposit offer or a withdraw
//! (allocate, consolidate onto the coordinator, send). Requests that cannot
//! proceed yet are deferred to the next cycle with their progress kept.

use crate::allocation::allocate;
use crate::book::{StorageTransfer, TrackedOffer};
use crate::custodian::ESCROW_UNDETERMINED;
use crate::ledger::{LedgerColumn, RowMove};
use crate::metrics::names;
use crate::pool::PoolMember;
use crate::retry::retry;
use crate::runner::RunnerContext;
use crate::types::{IntakePhase, Item, ItemState, OfferSpec, Phase, StatusUpdate, TradeKind, TradeRequest};
use anyhow::anyhow;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one request this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Declined,
    Deferred,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntakeReport {
    pub sent: usize,
    pub declined: usize,
    pub deferred: usize,
}

pub struct Intake {
    ctx: Arc<RunnerContext>,
}

impl Intake {
    pub fn new(ctx: Arc<RunnerContext>) -> Self {
        Self { ctx }
    }

    pub async fn run_cycle(&self) -> anyhow::Result<IntakeReport> {
        let ctx = &self.ctx;
        let queue = ctx.work_queue.clone();

        let fetched = match retry(ctx.retry_policy(), "fetch pending", || queue.fetch_pending()).await {
            Ok(requests) => requests,
            Err(e) => {
                warn!("Could not fetch pending requests: {}", e);
                Vec::new()
            }
        };
        let requests = self.merge(fetched).await;

        let mut report = IntakeReport::default();
        let mut updates: Vec<StatusUpdate> = Vec::new();

        for mut request in requests {
            match self.process(&mut request).await {
                Outcome::Sent => {
                    report.sent += 1;
                    updates.push(request.status_update());
                }
                Outcome::Declined => {
                    report.declined += 1;
                    ctx.metrics.increment(names::OFFERS_DECLINED, 1).await;
                    updates.push(request.status_update());
                }
                Outcome::Deferred => {
                    report.deferred += 1;
                    ctx.metrics.increment(names::REQUESTS_DEFERRED, 1).await;
                    ctx.book.defer(request).await;
                }
            }
        }

        ctx.push_updates(&updates).await;

        let coordinator = ctx.pool.coordinator().client.clone();
        if let Err(e) = retry(ctx.retry_policy(), "confirm offers", || coordinator.confirm_pending_offers()).await {
            warn!("Confirming coordinator offers failed: {}", e);
        }

        if report != IntakeReport::default() {
            info!(
                "Intake cycle: {} sent, {} declined, {} deferred",
                report.sent, report.declined, report.deferred
            );
        }
        Ok(report)
    }

    /// Deferred requests first, then fresh ones not already deferred or in flight
    async fn merge(&self, fetched: Vec<TradeRequest>) -> Vec<TradeRequest> {
        let mut merged = self.ctx.book.take_deferred().await;
        let mut seen: HashSet<String> = merged.iter().map(|r| r.request_id.clone()).collect();

        for request in fetched {
            if seen.contains(&request.request_id) {
                continue;
            }
            if self.ctx.book.is_in_flight(&request.request_id).await {
                debug!("Request {} already in flight", request.request_id);
                continue;
            }
            seen.insert(request.request_id.clone());
            merged.push(request);
        }
        merged
    }

    async fn process(&self, request: &mut TradeRequest) -> Outcome {
        if request.intake == IntakePhase::Pending {
            match self.check_escrow(request).await {
                Some(true) => request.intake = IntakePhase::EscrowChecked,
                Some(false) => {
                    request.set_phase(Phase::Declined);
                    return Outcome::Declined;
                }
                None => return Outcome::Deferred,
            }
        }

        if request.requested.is_empty() {
            warn!("Request {} lists no valid items", request.request_id);
            request.set_phase(Phase::Declined);
            return Outcome::Declined;
        }

        match request.kind {
            TradeKind::Deposit => self.deposit(request).await,
            TradeKind::Withdraw => self.withdraw(request).await,
        }
    }

    /// `Some(true)` to trade now, `Some(false)` to decline, `None` when the query failed
    async fn check_escrow(&self, request: &TradeRequest) -> Option<bool> {
        let coordinator = self.ctx.pool.coordinator().client.clone();
        let days = retry(self.ctx.retry_policy(), "escrow query", || {
            coordinator.escrow_days(&request.counterparty_id, &request.token)
        })
        .await;

        match days {
            Ok(0) => Some(true),
            Ok(days) => {
                if days == ESCROW_UNDETERMINED {
                    info!("Request {}: escrow undetermined, declining", request.request_id);
                } else {
                    info!("Request {}: counterparty has {} escrow days, declining", request.request_id, days);
                }
                self.ctx.metrics.increment(names::ESCROW_REJECTED, 1).await;
                Some(false)
            }
            Err(e) => {
                warn!("Request {}: escrow query failed: {}", request.request_id, e);
                None
            }
        }
    }

    async fn send_user_offer(&self, request: &TradeRequest, spec: &OfferSpec) -> anyhow::Result<String> {
        let coordinator = self.ctx.pool.coordinator().client.clone();
        let message = self.ctx.settings.offer_message(request.kind, &request.security_token);
        retry(self.ctx.retry_policy(), "send offer", || coordinator.send_offer(spec, &message)).await
    }

    async fn deposit(&self, request: &mut TradeRequest) -> Outcome {
        let spec = OfferSpec {
            counterparty_id: request.counterparty_id.clone(),
            token: request.token.clone(),
            give: Vec::new(),
            receive: request.requested.iter().map(|i| i.asset_handle.clone()).collect(),
        };

        match self.send_user_offer(request, &spec).await {
            Ok(offer_id) => {
                info!("Deposit offer {} sent to {}", offer_id, request.counterparty_id);
                self.mark_sent(request, offer_id).await;
                Outcome::Sent
            }
            Err(e) => {
                error!("Deposit offer to {} not sent: {}", request.counterparty_id, e);
                request.set_phase(Phase::Declined);
                Outcome::Declined
            }
        }
    }

    async fn mark_sent(&self, request: &mut TradeRequest, offer_id: String) {
        request.offer_id = Some(offer_id.clone());
        request.set_phase(Phase::Sent);
        self.ctx
            .book
            .enqueue(TrackedOffer::new(request.clone(), offer_id))
            .await;
        self.ctx.metrics.increment(names::OFFERS_SENT, 1).await;
    }

    async fn withdraw(&self, request: &mut TradeRequest) -> Outcome {
        let ctx = &self.ctx;
        let _selection = ctx.selection.lock().await;

        let candidates = match self.candidates(request).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Request {}: ledger lookup failed: {}", request.request_id, e);
                return Outcome::Deferred;
            }
        };

        let requested = request.requested_types();
        let allocation = allocate(&candidates, &requested);
        info!(
            "Request {}: found {}/{} items across {} custodians",
            request.request_id,
            allocation.picks.len(),
            requested.len(),
            allocation.custodians().len()
        );
        if !allocation.is_complete() {
            warn!(
                "Request {}: not enough stock for {:?}, trying again next cycle",
                request.request_id, allocation.unfulfilled
            );
            return Outcome::Deferred;
        }

        let coordinator = ctx.pool.coordinator();
        let coordinator_id = coordinator.id().to_string();
        let mut consolidating = Vec::new();
        // Rows expected in the coordinator's inventory once transfers land
        let mut expected: Vec<Item> = allocation
            .picks
            .iter()
            .filter(|i| i.custodian_id == coordinator_id)
            .cloned()
            .collect();
        let mut consolidation_failed = false;

        for custodian_id in allocation.custodians() {
            if custodian_id == coordinator_id {
                continue;
            }
            let rows: Vec<Item> = allocation
                .picks
                .iter()
                .filter(|i| i.custodian_id == custodian_id)
                .cloned()
                .collect();
            match self.consolidate(&custodian_id, rows.clone()).await {
                Ok(transfer_id) => {
                    consolidating.push(transfer_id);
                    expected.extend(rows);
                }
                Err(e) => {
                    warn!("Request {}: consolidation from {} failed: {}", request.request_id, custodian_id, e);
                    consolidation_failed = true;
                }
            }
        }

        if !consolidating.is_empty() {
            tokio::time::sleep(ctx.settings.timing.settle_delay()).await;
            let client = coordinator.client.clone();
            if let Err(e) = retry(ctx.retry_policy(), "accept incoming", || client.accept_incoming_offers()).await {
                warn!("Coordinator could not accept incoming offers: {}", e);
            }
        }

        let resolved = match ctx.resolve_on(coordinator, &expected).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("Request {}: coordinator inventory unavailable: {}", request.request_id, e);
                return Outcome::Deferred;
            }
        };

        // Items that reached the coordinator are its rows now, whatever happens next
        let arrived: Vec<RowMove> = resolved
            .iter()
            .filter(|(row, _)| row.custodian_id != coordinator_id)
            .map(|(row, handle)| RowMove {
                id: row.id,
                custodian_id: coordinator_id.clone(),
                asset_handle: Some(handle.clone()),
            })
            .collect();
        if !arrived.is_empty() {
            if let Err(e) = ctx.ledger.apply_moves(&arrived, ItemState::Active).await {
                ctx.ledger_failure("consolidation arrival", e).await;
                return Outcome::Deferred;
            }
            let arrived_ids: HashSet<i64> = arrived.iter().map(|m| m.id).collect();
            self.retire_settled(&consolidating, &arrived_ids).await;
        }

        if consolidation_failed || resolved.len() < allocation.picks.len() {
            info!(
                "Request {}: {}/{} items on the coordinator, trying again next cycle",
                request.request_id,
                resolved.len(),
                allocation.picks.len()
            );
            return Outcome::Deferred;
        }

        let handles: Vec<String> = resolved.iter().map(|(_, h)| h.clone()).collect();
        let spec = OfferSpec {
            counterparty_id: request.counterparty_id.clone(),
            token: request.token.clone(),
            give: handles.clone(),
            receive: Vec::new(),
        };

        let offer_id = match self.send_user_offer(request, &spec).await {
            Ok(offer_id) => offer_id,
            Err(e) => {
                error!("Withdraw offer to {} not sent: {}", request.counterparty_id, e);
                request.set_phase(Phase::Declined);
                return Outcome::Declined;
            }
        };
        info!("Withdraw offer {} sent to {}", offer_id, request.counterparty_id);

        let moves: Vec<RowMove> = resolved
            .iter()
            .map(|(row, handle)| RowMove {
                id: row.id,
                custodian_id: coordinator_id.clone(),
                asset_handle: Some(handle.clone()),
            })
            .collect();
        if let Err(e) = ctx.ledger.commit_offer(&handles, &moves, ItemState::Sent).await {
            ctx.ledger_failure("withdraw rows to sent", e).await;
            ctx.cancel_unrecorded(coordinator, &offer_id).await;
            request.offer_id = Some(offer_id);
            request.set_phase(Phase::Declined);
            return Outcome::Declined;
        }

        request.resolved = resolved
            .into_iter()
            .map(|(mut row, handle)| {
                row.custodian_id = coordinator_id.clone();
                row.asset_handle = handle;
                row.state = ItemState::Sent;
                row
            })
            .collect();
        self.mark_sent(request, offer_id).await;
        Outcome::Sent
    }

    /// Active rows of the requested types whose recorded handle is unused
    async fn candidates(&self, request: &TradeRequest) -> anyhow::Result<Vec<Item>> {
        let mut types: Vec<String> = Vec::new();
        for type_id in request.requested_types() {
            if !types.contains(&type_id) {
                types.push(type_id);
            }
        }

        let mut rows = Vec::new();
        for type_id in &types {
            rows.extend(
                self.ctx
                    .ledger
                    .find_by(LedgerColumn::TypeId, type_id, Some(ItemState::Active))
                    .await?,
            );
        }
        let recorded: Vec<String> = rows.iter().map(|r| r.asset_handle.clone()).collect();
        let used = self.ctx.ledger.used_among(&recorded).await?;
        Ok(rows.into_iter().filter(|r| !used.contains(&r.asset_handle)).collect())
    }

    /// Send `rows` from a storage custodian to the coordinator. Returns the transfer id.
    async fn consolidate(&self, custodian_id: &str, rows: Vec<Item>) -> anyhow::Result<uuid::Uuid> {
        let ctx = &self.ctx;
        let member: &PoolMember = ctx.pool.get(custodian_id)?;
        let coordinator = ctx.pool.coordinator();

        let resolved = ctx.resolve_on(member, &rows).await?;
        if resolved.len() < rows.len() {
            return Err(anyhow!(
                "only {}/{} items found in {}'s inventory",
                resolved.len(),
                rows.len(),
                custodian_id
            ));
        }

        let handles: Vec<String> = resolved.iter().map(|(_, h)| h.clone()).collect();
        let spec = OfferSpec {
            counterparty_id: coordinator.id().to_string(),
            token: coordinator.settings.trade_token.clone(),
            give: handles.clone(),
            receive: Vec::new(),
        };
        let client = member.client.clone();
        let message = ctx.settings.storage_message.clone();
        let offer_id = retry(ctx.retry_policy(), "in-house offer", || client.send_offer(&spec, &message)).await?;
        info!("In-house offer {} sent from {} to the coordinator", offer_id, custodian_id);

        let moves: Vec<RowMove> = resolved
            .iter()
            .map(|(row, handle)| RowMove {
                id: row.id,
                custodian_id: custodian_id.to_string(),
                asset_handle: Some(handle.clone()),
            })
            .collect();
        if let Err(e) = ctx.ledger.commit_offer(&handles, &moves, ItemState::OnHold).await {
            ctx.ledger_failure("consolidation rows to on_hold", e).await;
            ctx.cancel_unrecorded(member, &offer_id).await;
            return Err(anyhow!("in-house offer {} not recorded", offer_id));
        }

        let transfer = StorageTransfer::new(offer_id, custodian_id, coordinator.id(), rows);
        let transfer_id = transfer.transfer_id;
        ctx.book.add_transfer(transfer).await;
        ctx.metrics.increment(names::CONSOLIDATION_TRANSFERS, 1).await;

        if let Err(e) = retry(ctx.retry_policy(), "confirm offers", || client.confirm_pending_offers()).await {
            warn!("Custodian {} could not confirm offers: {}", custodian_id, e);
        }
        Ok(transfer_id)
    }

    /// Drop transfers whose every item has already arrived
    async fn retire_settled(&self, transfer_ids: &[uuid::Uuid], arrived: &HashSet<i64>) {
        let settled: HashSet<uuid::Uuid> = self
            .ctx
            .book
            .transfers_snapshot()
            .await
            .into_iter()
            .filter(|t| transfer_ids.contains(&t.transfer_id))
            .filter(|t| t.items.iter().all(|i| arrived.contains(&i.id)))
            .map(|t| t.transfer_id)
            .collect();
        self.ctx.book.retire_transfers(&settled).await;
    }
}
