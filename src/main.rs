//! Custody Runner - trade-lifecycle orchestrator for a pool of custody bots
//!
//! 1. Loads settings and opens the item ledger
//! 2. Connects every custodian through its protocol bridge
//! 3. Runs the intake and reconciliation loops
//! 4. Reads admin commands from stdin until shutdown

use custody_runner::{
    BridgeCustodian, ControlSurface, CustodianPool, HttpWorkQueue, ItemLedger, LogNotifier,
    Notifier, Orchestrator, PoolMember, RunnerContext, RunnerError, Settings, WebhookNotifier,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;

    let level = settings
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting Custody Runner...");

    let ledger = ItemLedger::connect(&settings.ledger_url).await?;
    info!("Ledger at {} holds {} items", settings.ledger_url, ledger.count().await?);

    let pool = build_pool(&settings)?;
    pool.connect_all().await;

    let work_queue = Arc::new(HttpWorkQueue::new(&settings.work_queue)?);
    let notifier: Arc<dyn Notifier> = match &settings.notifier.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, Duration::from_secs(10))?),
        None => Arc::new(LogNotifier),
    };

    let ctx = Arc::new(RunnerContext::new(
        settings,
        ledger,
        pool,
        work_queue,
        notifier.clone(),
    ));
    let orchestrator = Orchestrator::new(ctx.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(true);
        }
    });

    let control = ControlSurface::new(ctx.clone());
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    let reply = control.handle_line(&line).await;
                    notifier.post_message(&reply).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Control input closed: {}", e);
                    break;
                }
            }
        }
    });

    if let Err(e) = orchestrator.run(shutdown_rx).await {
        error!("Orchestrator stopped: {}", e);
        return Err(e.into());
    }

    for member in ctx.pool.members() {
        if let Err(e) = member.client.disconnect().await {
            warn!("Custodian {} disconnect failed: {}", member.settings.display_name(), e);
        }
    }
    info!("Custody Runner stopped");
    Ok(())
}

fn build_pool(settings: &Settings) -> Result<CustodianPool, RunnerError> {
    let mut members = Vec::with_capacity(settings.custodians.len());
    for custodian in &settings.custodians {
        let bridge_url = custodian.bridge_url.as_deref().ok_or_else(|| {
            RunnerError::InvalidConfig(format!("custodian {} has no bridge_url", custodian.id))
        })?;
        let client = BridgeCustodian::new(
            custodian.id.clone(),
            bridge_url,
            Duration::from_secs(custodian.timeout_secs),
        )
        .map_err(|e| RunnerError::InvalidConfig(format!("custodian {}: {}", custodian.id, e)))?;

        members.push(PoolMember {
            settings: custodian.clone(),
            client: Arc::new(client),
        });
    }
    CustodianPool::new(members)
}
