//! Runner snapshot written to state/now.json

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Writes the runner snapshot for external observers
pub struct StateManager {
    state_dir: PathBuf,
}

/// Current status (state/now.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NowState {
    pub timestamp: String,
    pub session: String,
    pub uptime_secs: u64,
    pub custodians_online: usize,
    pub custodians_total: usize,
    pub queued_offers: usize,
    pub active_offers: usize,
    pub storage_transfers: usize,
    pub ledger_items: i64,
    pub counters: BTreeMap<String, u64>,
}

impl StateManager {
    pub fn new(workspace_dir: impl AsRef<Path>) -> Self {
        Self {
            state_dir: workspace_dir.as_ref().join("state"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    pub async fn write_now(&self, state: &NowState) -> anyhow::Result<()> {
        let path = self.state_dir.join("now.json");
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }

    pub async fn read_now(&self) -> anyhow::Result<NowState> {
        let raw = fs::read_to_string(self.state_dir.join("now.json")).await?;
        Ok(serde_json::from_str(&raw)?)
    }
}
