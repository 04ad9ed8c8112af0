//! Admin control surface
//!
//! Parses text commands (a leading `!` is optional) and runs them against the
//! orchestrator. Commands that change the in-flight sets lock the session and
//! wait for both loops to go idle first.

use crate::runner::RunnerContext;
use crate::session::SessionState;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Help,
    Codes,
    Restart,
    Status,
    Offers,
    RemoveOffer(String),
    Pause,
    PauseAll,
    Unpause,
    Clear,
}

const HELP: &[(&str, &str)] = &[
    ("help", "List commands"),
    ("codes", "Authenticator code of every custodian"),
    ("restart", "Lock, reconnect every custodian, then resume"),
    ("status", "Session, custodians, offers and ledger summary"),
    ("offers", "List active offers"),
    ("removeoffer <requestId>", "Drop active offers for a request"),
    ("pause", "Stop taking new requests"),
    ("pauseall", "Stop both loops"),
    ("unpause", "Resume both loops"),
    ("clear", "Drop every queued and active offer"),
];

impl ControlCommand {
    /// `Err` carries the reply for an unknown or malformed command
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let line = line.strip_prefix('!').unwrap_or(line);
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or("").to_ascii_lowercase();
        let arg = parts.next();

        match (name.as_str(), arg) {
            ("help", _) => Ok(ControlCommand::Help),
            ("codes", _) => Ok(ControlCommand::Codes),
            ("restart", _) => Ok(ControlCommand::Restart),
            ("status", _) => Ok(ControlCommand::Status),
            ("offers" | "list-offers", _) => Ok(ControlCommand::Offers),
            ("removeoffer" | "remove-offer", Some(id)) => Ok(ControlCommand::RemoveOffer(id.to_string())),
            ("removeoffer" | "remove-offer", None) => Err("Usage: removeoffer <requestId>".to_string()),
            ("pause", _) => Ok(ControlCommand::Pause),
            ("pauseall" | "pause-all", _) => Ok(ControlCommand::PauseAll),
            ("unpause", _) => Ok(ControlCommand::Unpause),
            ("clear", _) => Ok(ControlCommand::Clear),
            ("", _) => Err("Empty command, try help".to_string()),
            (other, _) => Err(format!("Unknown command '{}', try help", other)),
        }
    }
}

pub struct ControlSurface {
    ctx: Arc<RunnerContext>,
}

impl ControlSurface {
    pub fn new(ctx: Arc<RunnerContext>) -> Self {
        Self { ctx }
    }

    /// Parse and run one line; the reply is always a text report
    pub async fn handle_line(&self, line: &str) -> String {
        match ControlCommand::parse(line) {
            Ok(command) => self.execute(command).await,
            Err(reply) => reply,
        }
    }

    pub async fn execute(&self, command: ControlCommand) -> String {
        info!("Control command: {:?}", command);
        let ctx = &self.ctx;

        match command {
            ControlCommand::Help => HELP
                .iter()
                .map(|(name, what)| format!("{:<24} {}", name, what))
                .collect::<Vec<_>>()
                .join("\n"),
            ControlCommand::Codes => self.codes().await,
            ControlCommand::Restart => self.restart().await,
            ControlCommand::Status => self.status().await,
            ControlCommand::Offers => self.offers().await,
            ControlCommand::RemoveOffer(request_id) => {
                ctx.gate.lock_and_wait().await;
                let removed = ctx.book.remove_by_request(&request_id).await;
                ctx.gate.set(SessionState::Active);
                format!("Removed {} offers for request {}", removed, request_id)
            }
            ControlCommand::Pause => {
                ctx.gate.set(SessionState::Paused);
                "Paused: no new requests will be taken".to_string()
            }
            ControlCommand::PauseAll => {
                ctx.gate.set(SessionState::Locked);
                "Locked: both loops paused".to_string()
            }
            ControlCommand::Unpause => {
                ctx.gate.set(SessionState::Active);
                "Resumed".to_string()
            }
            ControlCommand::Clear => {
                ctx.gate.lock_and_wait().await;
                let dropped = ctx.book.clear().await;
                ctx.gate.set(SessionState::Active);
                format!("Cleared {} offers", dropped)
            }
        }
    }

    async fn codes(&self) -> String {
        let mut out = String::new();
        for member in self.ctx.pool.members() {
            let code = match member.client.auth_code().await {
                Ok(code) => code,
                Err(e) => format!("unavailable ({})", e),
            };
            let _ = writeln!(out, "{}: {}", member.settings.display_name(), code);
        }
        out.trim_end().to_string()
    }

    async fn restart(&self) -> String {
        let ctx = &self.ctx;
        ctx.gate.lock_and_wait().await;

        let mut out = String::from("Reconnecting custodians\n");
        for (name, state) in ctx.pool.reconnect_all().await {
            let _ = writeln!(out, "{}: {:?}", name, state);
        }

        tokio::time::sleep(ctx.settings.timing.restart_grace()).await;
        ctx.gate.set(SessionState::Active);
        out.push_str("Session active");
        out
    }

    async fn status(&self) -> String {
        let now = self.ctx.now_state().await;
        let counts = self.ctx.book.counts().await;

        let mut out = String::new();
        let _ = writeln!(out, "Session: {}", now.session);
        let _ = writeln!(out, "Uptime: {}s", now.uptime_secs);
        let _ = writeln!(
            out,
            "Custodians: {} online, {} offline",
            now.custodians_online,
            now.custodians_total - now.custodians_online
        );
        let _ = writeln!(
            out,
            "Deposits: {} active, {} queued",
            counts.deposits_active, counts.deposits_queued
        );
        let _ = writeln!(
            out,
            "Withdraws: {} active, {} queued",
            counts.withdraws_active, counts.withdraws_queued
        );
        let _ = writeln!(out, "Storage transfers: {}", counts.transfers);
        let _ = writeln!(out, "Deferred requests: {}", counts.deferred);
        let _ = writeln!(out, "Ledger items: {}", now.ledger_items);
        for (name, value) in &now.counters {
            let _ = writeln!(out, "{}: {}", name, value);
        }
        out.trim_end().to_string()
    }

    async fn offers(&self) -> String {
        let active = self.ctx.book.active_snapshot().await;
        if active.is_empty() {
            return "No active offers".to_string();
        }

        let mut out = String::new();
        for offer in active {
            let _ = writeln!(
                out,
                "{} | request {} | {} | errors {} | offer {}",
                offer.request.counterparty_id,
                offer.request.request_id,
                offer.request.kind,
                offer.request.error_count,
                offer.offer_id
            );
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ControlCommand::parse("!help"), Ok(ControlCommand::Help));
        assert_eq!(ControlCommand::parse("status"), Ok(ControlCommand::Status));
        assert_eq!(ControlCommand::parse("list-offers"), Ok(ControlCommand::Offers));
        assert_eq!(ControlCommand::parse("!PAUSEALL"), Ok(ControlCommand::PauseAll));
        assert_eq!(ControlCommand::parse("pause-all"), Ok(ControlCommand::PauseAll));
        assert_eq!(
            ControlCommand::parse("!removeoffer 42"),
            Ok(ControlCommand::RemoveOffer("42".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ControlCommand::parse("removeoffer").is_err());
        assert!(ControlCommand::parse("").is_err());
        assert!(ControlCommand::parse("!selfdestruct").is_err());
    }
}
