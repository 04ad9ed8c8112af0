//! Core types shared by the ledger, the allocator and both loops

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Lifecycle state of a ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Held by its custodian and available for allocation
    Active,
    /// Moving between two custodians of the pool
    OnHold,
    /// Committed to an outgoing user offer
    Sent,
    /// Delivered to the user; terminal
    Accepted,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Active => "active",
            ItemState::OnHold => "on_hold",
            ItemState::Sent => "sent",
            ItemState::Accepted => "accepted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(ItemState::Active),
            "on_hold" => Some(ItemState::OnHold),
            "sent" => Some(ItemState::Sent),
            "accepted" => Some(ItemState::Accepted),
            _ => None,
        }
    }

    /// Whether a row may move from `self` to `next`.
    ///
    /// Legal moves are `Active -> {Sent, OnHold}` and `{Sent, OnHold} -> {Accepted, Active}`.
    /// Re-applying the current state is an idempotent no-op.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Active, Sent)
                | (Active, OnHold)
                | (Sent, Accepted)
                | (Sent, Active)
                | (OnHold, Accepted)
                | (OnHold, Active)
        )
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub custodian_id: String,
    pub asset_handle: String,
    pub type_id: String,
    pub state: ItemState,
}

/// A row about to be inserted; the ledger assigns the id and starts it Active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewItem {
    pub custodian_id: String,
    pub asset_handle: String,
    pub type_id: String,
}

/// One entry of a custodian's live inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub asset_handle: String,
    pub type_id: String,
}

impl InventoryItem {
    pub fn new(asset_handle: impl Into<String>, type_id: impl Into<String>) -> Self {
        Self {
            asset_handle: asset_handle.into(),
            type_id: type_id.into(),
        }
    }
}

/// An item named by a request, given on the wire as `handle;typeId`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedItem {
    pub asset_handle: String,
    pub type_id: String,
}

impl RequestedItem {
    /// Parse `handle;typeId`. Both halves must be non-empty digit strings.
    pub fn parse(raw: &str) -> Option<Self> {
        let (handle, type_id) = raw.trim().split_once(';')?;
        let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
        if !numeric(handle) || !numeric(type_id) {
            return None;
        }
        Some(Self {
            asset_handle: handle.to_string(),
            type_id: type_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeKind {
    /// We request the user's items
    Deposit,
    /// We send custodied items to the user
    Withdraw,
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeKind::Deposit => write!(f, "deposit"),
            TradeKind::Withdraw => write!(f, "withdraw"),
        }
    }
}

/// Where a request stands from the work queue's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Declined,
    Sent,
    Accepted,
}

/// Request status, tagged by request kind.
///
/// The work queue speaks integer codes whose meaning depends on the kind:
/// deposits use 1-4 and withdraws 6-9 (pending, declined, sent, accepted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Deposit(Phase),
    Withdraw(Phase),
}

impl RequestStatus {
    pub fn pending(kind: TradeKind) -> Self {
        Self::new(kind, Phase::Pending)
    }

    pub fn new(kind: TradeKind, phase: Phase) -> Self {
        match kind {
            TradeKind::Deposit => RequestStatus::Deposit(phase),
            TradeKind::Withdraw => RequestStatus::Withdraw(phase),
        }
    }

    pub fn kind(&self) -> TradeKind {
        match self {
            RequestStatus::Deposit(_) => TradeKind::Deposit,
            RequestStatus::Withdraw(_) => TradeKind::Withdraw,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            RequestStatus::Deposit(p) | RequestStatus::Withdraw(p) => *p,
        }
    }

    pub fn code(&self) -> u8 {
        let offset = match self.phase() {
            Phase::Pending => 1,
            Phase::Declined => 2,
            Phase::Sent => 3,
            Phase::Accepted => 4,
        };
        match self {
            RequestStatus::Deposit(_) => offset,
            RequestStatus::Withdraw(_) => offset + 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let (kind, offset) = match code {
            1..=4 => (TradeKind::Deposit, code),
            6..=9 => (TradeKind::Withdraw, code - 5),
            _ => return None,
        };
        let phase = match offset {
            1 => Phase::Pending,
            2 => Phase::Declined,
            3 => Phase::Sent,
            _ => Phase::Accepted,
        };
        Some(Self::new(kind, phase))
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.kind(), self.phase())
    }
}

fn serialize_code<S: Serializer>(status: &RequestStatus, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&status.code().to_string())
}

/// Intake progress of a request, so deferred requests resume where they stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntakePhase {
    Pending,
    EscrowChecked,
}

/// A deposit or withdraw request taken from the work queue
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRequest {
    pub request_id: String,
    pub counterparty_id: String,
    /// Counterparty trade token
    pub token: String,
    /// Shown to the user in the offer message
    pub security_token: String,
    pub kind: TradeKind,
    pub requested: Vec<RequestedItem>,
    /// Ledger rows allocated to a withdraw
    pub resolved: Vec<Item>,
    pub status: RequestStatus,
    pub offer_id: Option<String>,
    pub error_count: u32,
    pub intake: IntakePhase,
}

impl TradeRequest {
    pub fn new(
        kind: TradeKind,
        request_id: impl Into<String>,
        counterparty_id: impl Into<String>,
        token: impl Into<String>,
        security_token: impl Into<String>,
        requested: Vec<RequestedItem>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            counterparty_id: counterparty_id.into(),
            token: token.into(),
            security_token: security_token.into(),
            kind,
            requested,
            resolved: Vec::new(),
            status: RequestStatus::pending(kind),
            offer_id: None,
            error_count: 0,
            intake: IntakePhase::Pending,
        }
    }

    /// Requested type ids, one entry per requested unit
    pub fn requested_types(&self) -> Vec<String> {
        self.requested.iter().map(|i| i.type_id.clone()).collect()
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.status = RequestStatus::new(self.kind, phase);
    }

    pub fn status_update(&self) -> StatusUpdate {
        StatusUpdate {
            request_id: self.request_id.clone(),
            counterparty_id: self.counterparty_id.clone(),
            status: self.status,
            offer_id: self.offer_id.clone(),
        }
    }
}

/// A status callback for the work queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    #[serde(rename = "Id")]
    pub request_id: String,
    #[serde(rename = "SteamId")]
    pub counterparty_id: String,
    #[serde(rename = "Status", serialize_with = "serialize_code")]
    pub status: RequestStatus,
    #[serde(rename = "Tradelink", skip_serializing_if = "Option::is_none")]
    pub offer_id: Option<String>,
}

/// Remote state of a trade offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferState {
    NeedsConfirmation,
    Active,
    Accepted,
    Declined,
    Countered,
    Expired,
    Canceled,
    Unknown,
}

impl OfferState {
    /// Final states other than `Accepted`
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            OfferState::Declined | OfferState::Countered | OfferState::Expired | OfferState::Canceled
        )
    }
}

/// A trade offer as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOffer {
    pub offer_id: String,
    pub state: OfferState,
    pub created_at: DateTime<Utc>,
}

/// What to put into an outgoing offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferSpec {
    pub counterparty_id: String,
    pub token: String,
    /// Handles from our own inventory
    pub give: Vec<String>,
    /// Handles from the counterparty's inventory
    pub receive: Vec<String>,
}

/// Connection state of a custodian session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Error,
    Disconnected,
    Connected,
}

/// Role of a custodian in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustodianRole {
    /// Trades directly with users
    Coordinator,
    /// Holds items in trust
    Storage,
}
