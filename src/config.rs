//! Runner settings
//!
//! Loaded from an optional file (path in `CUSTODY_CONFIG`, default
//! `config/custody`, any format the `config` crate knows) overlaid by
//! `CUSTODY__*` environment variables, e.g. `CUSTODY__TIMING__INTAKE_INTERVAL_SECS=3`.

use crate::error::RunnerError;
use crate::retry::RetryPolicy;
use crate::types::{CustodianRole, TradeKind};
use serde::Deserialize;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Shown in user offer messages as `<SITE> DEPOSIT | <token>`
    #[serde(default = "default_site_name")]
    pub site_name: String,
    /// Message attached to in-house transfers between custodians
    #[serde(default = "default_storage_message")]
    pub storage_message: String,
    #[serde(default = "default_ledger_url")]
    pub ledger_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for state/now.json; no snapshots when unset
    #[serde(default)]
    pub state_dir: Option<String>,
    pub work_queue: WorkQueueSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
    pub custodians: Vec<CustodianSettings>,
    #[serde(default)]
    pub timing: TimingSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkQueueSettings {
    /// Returns pending deposits and withdraws
    pub fetch_url: String,
    /// Receives status callbacks
    pub callback_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierSettings {
    /// Discord-style webhook; messages only go to the log when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// One bot identity
#[derive(Debug, Clone, Deserialize)]
pub struct CustodianSettings {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub role: CustodianRole,
    /// Token other pool members need to send this custodian an offer
    pub trade_token: String,
    /// Protocol-bridge sidecar serving this identity
    #[serde(default)]
    pub bridge_url: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

impl CustodianSettings {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Loop pacing and waits
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSettings {
    #[serde(default = "default_intake_interval_secs")]
    pub intake_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Deposit offers still open after this long are cancelled
    #[serde(default = "default_offer_expiry_secs")]
    pub offer_expiry_secs: u64,
    /// Wait after consolidation transfers before reading the coordinator inventory
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_restart_grace_secs")]
    pub restart_grace_secs: u64,
    #[serde(default = "default_gate_poll_ms")]
    pub gate_poll_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            intake_interval_secs: default_intake_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            offer_expiry_secs: default_offer_expiry_secs(),
            settle_delay_ms: default_settle_delay_ms(),
            restart_grace_secs: default_restart_grace_secs(),
            gate_poll_ms: default_gate_poll_ms(),
        }
    }
}

impl TimingSettings {
    pub fn intake_interval(&self) -> Duration {
        Duration::from_secs(self.intake_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_secs)
    }

    pub fn gate_poll(&self) -> Duration {
        Duration::from_millis(self.gate_poll_ms)
    }
}

/// Storage rebalancing limits
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Coordinator Active rows at which rebalancing starts
    #[serde(default = "default_host_item_limit")]
    pub host_item_limit: usize,
    /// Inventory size a storage custodian is filled up to
    #[serde(default = "default_item_limit_per_custodian")]
    pub item_limit_per_custodian: usize,
    /// Items per rebalance offer
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            host_item_limit: default_host_item_limit(),
            item_limit_per_custodian: default_item_limit_per_custodian(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

fn default_site_name() -> String {
    "custody".to_string()
}

fn default_storage_message() -> String {
    "STORAGE".to_string()
}

fn default_ledger_url() -> String {
    "sqlite://custody.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_intake_interval_secs() -> u64 {
    5
}

fn default_reconcile_interval_secs() -> u64 {
    7
}

fn default_offer_expiry_secs() -> u64 {
    600
}

fn default_settle_delay_ms() -> u64 {
    5000
}

fn default_restart_grace_secs() -> u64 {
    10
}

fn default_gate_poll_ms() -> u64 {
    500
}

fn default_host_item_limit() -> usize {
    200
}

fn default_item_limit_per_custodian() -> usize {
    900
}

fn default_max_batch_size() -> usize {
    100
}

impl Settings {
    /// Load from `CUSTODY_CONFIG` (or `config/custody`) and `CUSTODY__*` env vars
    pub fn load() -> Result<Self, RunnerError> {
        let path = std::env::var("CUSTODY_CONFIG").unwrap_or_else(|_| "config/custody".to_string());
        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(config::Environment::with_prefix("CUSTODY").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from an in-memory TOML document
    pub fn from_toml(raw: &str) -> Result<Self, RunnerError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if self.custodians.is_empty() {
            return Err(RunnerError::InvalidConfig("no custodians configured".into()));
        }
        for custodian in &self.custodians {
            if custodian.id.trim().is_empty() {
                return Err(RunnerError::InvalidConfig("custodian with empty id".into()));
            }
            if custodian.trade_token.trim().is_empty() {
                return Err(RunnerError::InvalidConfig(format!(
                    "custodian {} has no trade token",
                    custodian.id
                )));
            }
        }
        for (i, custodian) in self.custodians.iter().enumerate() {
            if self.custodians[..i].iter().any(|c| c.id == custodian.id) {
                return Err(RunnerError::InvalidConfig(format!(
                    "duplicate custodian id {}",
                    custodian.id
                )));
            }
        }

        let coordinators: Vec<&str> = self
            .custodians
            .iter()
            .filter(|c| c.role == CustodianRole::Coordinator)
            .map(|c| c.id.as_str())
            .collect();
        match coordinators.len() {
            0 => Err(RunnerError::NoCoordinator),
            1 => Ok(()),
            _ => Err(RunnerError::MultipleCoordinators(coordinators.join(", "))),
        }
    }

    /// Message on user offers, e.g. `EXAMPLE WITHDRAW | XK2`
    pub fn offer_message(&self, kind: TradeKind, security_token: &str) -> String {
        format!(
            "{} {} | {}",
            self.site_name.to_uppercase(),
            kind.to_string().to_uppercase(),
            security_token
        )
    }
}
