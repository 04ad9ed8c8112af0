//! Error types for the ledger and the runner

use crate::types::ItemState;
use thiserror::Error;

/// Item ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("ledger row {id} not found")]
    RowMissing { id: i64 },

    #[error("illegal transition for row {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: ItemState,
        to: ItemState,
    },

    #[error("undecodable row: {0}")]
    Decode(String),
}

/// Startup and orchestration errors
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no coordinator among configured custodians")]
    NoCoordinator,

    #[error("more than one coordinator configured: {0}")]
    MultipleCoordinators(String),

    #[error("unknown custodian: {0}")]
    UnknownCustodian(String),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("{loop_name} loop failed: {reason}")]
    LoopFailed { loop_name: &'static str, reason: String },
}

pub type LedgerResult<T> = Result<T, LedgerError>;
