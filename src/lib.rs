//! Custody Runner Library
//!
//! Trade-lifecycle orchestration for a pool of custody bots: request intake,
//! item allocation, offer reconciliation and storage rebalancing over a
//! durable item ledger.

pub mod allocation;
pub mod book;
pub mod config;
pub mod control;
pub mod custodian;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod metrics;
pub mod notifier;
pub mod pool;
pub mod reconciler;
pub mod retry;
pub mod runner;
pub mod session;
pub mod state;
pub mod types;
pub mod work_queue;

// Re-export main types for convenience
pub use allocation::{allocate, resolve_handles, Allocation};
pub use book::{OfferBook, StorageTransfer, TrackedOffer};
pub use config::{CustodianSettings, Settings};
pub use control::{ControlCommand, ControlSurface};
pub use custodian::{BridgeCustodian, Custodian, ESCROW_UNDETERMINED};
pub use error::{LedgerError, RunnerError};
pub use intake::Intake;
pub use ledger::{ItemLedger, LedgerColumn, RowMove};
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use pool::{CustodianPool, PoolMember};
pub use reconciler::Reconciler;
pub use runner::{Orchestrator, RunnerContext};
pub use session::{SessionGate, SessionState};
pub use types::{
    ConnectionState, CustodianRole, InventoryItem, Item, ItemState, OfferSpec, OfferState, Phase,
    RemoteOffer, RequestStatus, TradeKind, TradeRequest,
};
pub use work_queue::{HttpWorkQueue, WorkQueue};
