//! lspmux — multiplexing proxy for LSP-style JSON-RPC backends.
//!
//! Routes calls from many client sessions to a pool of backend servers,
//! one live connection per workspace identity. Connections are dialed on
//! first use, initialized exactly once, and reclaimed when idle.
//!
//! Usage:
//!   lspmux --server go=127.0.0.1:4389 --workspace-root /var/lspmux/workspaces
//!   lspmux --server go=... --server rust=... --max-idle-secs 300

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lspmux_proxy::{Proxy, ProxyConfig, Reaper};
use lspmux_services::{LocalFsProvider, SessionRegistry, TracingTelemetry};
use lspmux_transport::TcpDialer;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lspmux", about = "Multiplexing proxy for LSP-style JSON-RPC backends")]
struct Cli {
    /// Backend address per mode, as mode=host:port (repeatable)
    #[arg(long = "server", value_name = "MODE=ADDR", required = true)]
    servers: Vec<String>,

    /// Base directory containing workspace checkouts
    #[arg(long, value_name = "DIR")]
    workspace_root: PathBuf,

    /// Disconnect backends idle longer than this many seconds
    #[arg(long, default_value = "300")]
    max_idle_secs: u64,

    /// Seconds between idle sweeps
    #[arg(long, default_value = "60")]
    reap_interval_secs: u64,

    /// Bound on the initialize handshake, in seconds
    #[arg(long, default_value = "30")]
    init_timeout_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn parse_servers(specs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut addrs = HashMap::new();
    for spec in specs {
        let (mode, addr) = spec.split_once('=').with_context(|| {
            format!("invalid --server spec {spec:?}, expected mode=host:port")
        })?;
        addrs.insert(mode.to_string(), addr.to_string());
    }
    Ok(addrs)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addrs = parse_servers(&cli.servers)?;
    let modes: Vec<&str> = addrs.keys().map(|s| s.as_str()).collect();
    info!("backend modes configured: {}", modes.join(", "));

    let sessions = Arc::new(SessionRegistry::new());
    let config = ProxyConfig {
        init_timeout: Duration::from_secs(cli.init_timeout_secs),
        ..Default::default()
    };
    let proxy = Proxy::new(
        config,
        TcpDialer::new(addrs),
        LocalFsProvider::new(cli.workspace_root.clone()),
        sessions.clone(),
        Arc::new(TracingTelemetry),
    );

    let shutdown = Arc::new(Notify::new());
    let reaper = Reaper::new(
        proxy.clone(),
        Duration::from_secs(cli.max_idle_secs),
        Duration::from_secs(cli.reap_interval_secs),
    );
    let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

    info!(
        "lspmux ready (workspace root {}, idle threshold {}s)",
        cli.workspace_root.display(),
        cli.max_idle_secs
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");

    shutdown.notify_one();
    if let Err(e) = proxy.shutdown_all().await {
        warn!("backend shutdown: {e}");
    }
    let _ = reaper_task.await;

    Ok(())
}
