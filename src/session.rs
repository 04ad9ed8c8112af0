//! Session gate shared by both loops and the control surface
//!
//! The control surface sets the state; each loop checks the gate at the top
//! of every iteration and reports itself idle while it waits. `Paused` holds
//! only the intake loop, `Locked` holds both.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Locked,
}

impl SessionState {
    fn to_u8(self) -> u8 {
        match self {
            SessionState::Active => 0,
            SessionState::Paused => 1,
            SessionState::Locked => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Paused,
            _ => SessionState::Locked,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Paused => write!(f, "paused"),
            SessionState::Locked => write!(f, "locked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Intake,
    Reconcile,
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopKind::Intake => write!(f, "intake"),
            LoopKind::Reconcile => write!(f, "reconcile"),
        }
    }
}

pub struct SessionGate {
    state: AtomicU8,
    intake_idle: AtomicBool,
    reconcile_idle: AtomicBool,
    poll: Duration,
}

impl SessionGate {
    pub fn new(poll: Duration) -> Self {
        Self {
            state: AtomicU8::new(SessionState::Active.to_u8()),
            // A loop that has not started holds nothing
            intake_idle: AtomicBool::new(true),
            reconcile_idle: AtomicBool::new(true),
            poll,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: SessionState) {
        let previous = SessionState::from_u8(self.state.swap(state.to_u8(), Ordering::SeqCst));
        if previous != state {
            debug!("Session state {} -> {}", previous, state);
        }
    }

    fn idle_flag(&self, kind: LoopKind) -> &AtomicBool {
        match kind {
            LoopKind::Intake => &self.intake_idle,
            LoopKind::Reconcile => &self.reconcile_idle,
        }
    }

    fn allows(&self, kind: LoopKind) -> bool {
        match (self.state(), kind) {
            (SessionState::Active, _) => true,
            (SessionState::Paused, LoopKind::Reconcile) => true,
            _ => false,
        }
    }

    pub fn is_idle(&self, kind: LoopKind) -> bool {
        self.idle_flag(kind).load(Ordering::SeqCst)
    }

    /// Record that a loop holds nothing, e.g. because it exited
    pub fn mark_idle(&self, kind: LoopKind) {
        self.idle_flag(kind).store(true, Ordering::SeqCst);
    }

    /// Wait until `kind` may run a cycle.
    ///
    /// Returns `false` once shutdown is signalled.
    pub async fn wait_runnable(&self, kind: LoopKind, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                self.mark_idle(kind);
                return false;
            }

            if self.allows(kind) {
                self.idle_flag(kind).store(false, Ordering::SeqCst);
                // A lock may have landed between the check and the store
                if self.allows(kind) {
                    return true;
                }
            }
            self.mark_idle(kind);

            tokio::select! {
                _ = tokio::time::sleep(self.poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Lock the session and wait until both loops are idle
    pub async fn lock_and_wait(&self) {
        self.set(SessionState::Locked);
        while !(self.is_idle(LoopKind::Intake) && self.is_idle(LoopKind::Reconcile)) {
            tokio::time::sleep(self.poll).await;
        }
        debug!("Both loops idle");
    }
}
