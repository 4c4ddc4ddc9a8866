//! remsim-openwrt
//!
//! Remote-SIM client daemon for OpenWRT routers.
//!
//! - Optionally registers with the IonMesh orchestrator and retargets the
//!   session at the assigned bankd slot, then keeps the registration alive
//!   with heartbeats
//! - Relays APDUs to the modem over `AT+CSIM` and polls signal quality
//! - Switches the modem between local and remote SIM through sysfs GPIO
//! - `SIGUSR1` dumps statistics; `SIGINT`/`SIGTERM` restore the local SIM
//!   and exit

mod config;
mod orchestrator;
mod session;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use remsim_bridge::bridge::{open_primary_channel, script_env};
use remsim_bridge::gpio::SysfsGpio;
use remsim_bridge::{Bridge, BridgeConfig, BridgeHandle};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Config, ConfigInput, MODEM_DEVICE_CANDIDATES};
use crate::orchestrator::{OrchestratorClient, ReqwestTransport};
use crate::session::SessionConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let hostname = gethostname().unwrap_or_else(|| "remsim-openwrt".into());
    let file = ConfigInput::load(&cli.config)?;
    let mut config = Config::resolve(&cli, file, &hostname).context("invalid configuration")?;
    config.detect_modem_device(MODEM_DEVICE_CANDIDATES);

    tracing::info!(
        hostname = %hostname,
        server = %format!("{}:{}", config.server_host, config.server_port),
        dual_modem = config.setup.secondary().is_some(),
        orchestrator = config.orchestrator.is_some(),
        "remsim-openwrt starting"
    );

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut session_config = SessionConfig::from_config(&config);

    // ── Orchestrator registration ───────────────────────────────
    let mut registered = None;
    let mut heartbeat_handle = None;
    if let Some(orch) = config.orchestrator.clone() {
        let client = Arc::new(OrchestratorClient::new(orch, ReqwestTransport::new()?));
        match client.register().await {
            Ok(assignment) => {
                session_config.apply(&assignment);
                heartbeat_handle = Some(tokio::spawn(orchestrator::run_heartbeat(
                    client.clone(),
                    config.heartbeat_interval,
                    shutdown_rx.clone(),
                )));
                registered = Some(client);
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "orchestrator registration failed, using configured server"
                );
            }
        }
    }

    // ── Modem bridge ────────────────────────────────────────────
    let bridge_config = BridgeConfig {
        setup: config.setup.clone(),
        signal_interval_secs: config.signal_interval,
    };
    for (key, value) in script_env(&bridge_config.setup) {
        tracing::debug!(%key, %value, "event script environment");
    }
    let channel = open_primary_channel(&bridge_config.setup);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (bridge, handle) = Bridge::new(
        &bridge_config,
        channel,
        Arc::new(SysfsGpio::default()),
        Box::new(events_tx),
    );
    let bridge_handle = tokio::spawn(bridge.run());
    let session_handle = tokio::spawn(session::run(session_config, events_rx));

    // ── Signals ─────────────────────────────────────────────────
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = sigusr1.recv() => dump_stats(&handle).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    if let Err(e) = handle.shutdown().await {
        tracing::warn!(error = %e, "bridge already stopped");
    }
    drop(handle);
    if let Err(e) = bridge_handle.await {
        tracing::error!("bridge task failed: {e}");
    }
    let _ = session_handle.await;

    if let Some(handle) = heartbeat_handle {
        let _ = handle.await;
    }
    if let Some(client) = registered {
        if let Err(e) = client.unregister().await {
            tracing::warn!(error = %e, "unregister failed");
        }
    }

    tracing::info!("remsim-openwrt stopped");
    Ok(())
}

async fn dump_stats(handle: &BridgeHandle) {
    match handle.stats().await {
        Ok(stats) => tracing::info!(
            tpdus_sent = stats.tpdus_sent,
            tpdus_received = stats.tpdus_received,
            errors = stats.errors,
            reconnections = stats.reconnections,
            sim_switches = stats.sim_switches,
            rssi_dbm = ?stats.signal.map(|s| s.rssi_dbm),
            signal_at = ?stats.signal.map(|s| s.sampled_at.to_rfc3339()),
            atr = ?stats.atr,
            "statistics"
        ),
        Err(e) => tracing::warn!(error = %e, "statistics unavailable"),
    }
}

fn gethostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .or_else(|_| std::fs::read_to_string("/etc/hostname"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
