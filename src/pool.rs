//! Custodian pool: one coordinator plus the storage custodians

use crate::config::CustodianSettings;
use crate::custodian::Custodian;
use crate::error::RunnerError;
use crate::types::{ConnectionState, CustodianRole};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct PoolMember {
    pub settings: CustodianSettings,
    pub client: Arc<dyn Custodian>,
}

impl PoolMember {
    pub fn id(&self) -> &str {
        &self.settings.id
    }
}

pub struct CustodianPool {
    coordinator: PoolMember,
    storage: Vec<PoolMember>,
}

impl CustodianPool {
    /// Assign roles from settings. Fails unless exactly one coordinator is present.
    pub fn new(members: Vec<PoolMember>) -> Result<Self, RunnerError> {
        let mut coordinator = None;
        let mut storage = Vec::new();

        for member in members {
            match member.settings.role {
                CustodianRole::Coordinator => {
                    if let Some(existing) = coordinator.as_ref().map(|c: &PoolMember| c.id()) {
                        return Err(RunnerError::MultipleCoordinators(format!(
                            "{}, {}",
                            existing,
                            member.id()
                        )));
                    }
                    coordinator = Some(member);
                }
                CustodianRole::Storage => storage.push(member),
            }
        }

        let coordinator = coordinator.ok_or(RunnerError::NoCoordinator)?;
        info!(
            "Custodian pool: coordinator {} with {} storage custodians",
            coordinator.settings.display_name(),
            storage.len()
        );
        Ok(Self {
            coordinator,
            storage,
        })
    }

    pub fn coordinator(&self) -> &PoolMember {
        &self.coordinator
    }

    pub fn coordinator_id(&self) -> &str {
        self.coordinator.id()
    }

    pub fn storage(&self) -> &[PoolMember] {
        &self.storage
    }

    /// Every member, coordinator first
    pub fn members(&self) -> impl Iterator<Item = &PoolMember> {
        std::iter::once(&self.coordinator).chain(self.storage.iter())
    }

    pub fn get(&self, id: &str) -> Result<&PoolMember, RunnerError> {
        self.members()
            .find(|m| m.id() == id)
            .ok_or_else(|| RunnerError::UnknownCustodian(id.to_string()))
    }

    /// Connect every member; failures are logged and leave the member offline
    pub async fn connect_all(&self) {
        for member in self.members() {
            if let Err(e) = member.client.connect().await {
                warn!("Custodian {} failed to connect: {}", member.settings.display_name(), e);
            }
        }
    }

    /// Reconnect every member and report each one's resulting state
    pub async fn reconnect_all(&self) -> Vec<(String, ConnectionState)> {
        let mut report = Vec::new();
        for member in self.members() {
            let state = match member.client.reconnect().await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Custodian {} failed to reconnect: {}", member.settings.display_name(), e);
                    member.client.connection_state().await
                }
            };
            report.push((member.settings.display_name().to_string(), state));
        }
        report
    }

    /// (online, total)
    pub async fn online_count(&self) -> (usize, usize) {
        let mut online = 0;
        let mut total = 0;
        for member in self.members() {
            total += 1;
            if member.client.connection_state().await == ConnectionState::Connected {
                online += 1;
            }
        }
        (online, total)
    }
}
