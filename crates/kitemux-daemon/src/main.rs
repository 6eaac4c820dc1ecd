//! kitemux Daemon
//!
//! Keeps tunnels open to frontend relays and forwards the streams they
//! carry to local backend services.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use kitemux_core::Kite;
use kitemux_core::config::{FrontendSpec, load_config};
use kitemux_core::tracing_init::{default_filter, init_tracing};
use kitemux_daemon::context::Context;
use kitemux_daemon::handshake::PageKiteConnector;
use kitemux_daemon::manager::Manager;

#[derive(Parser, Debug)]
#[command(name = "kitemux-daemon")]
#[command(version, about = "kitemux daemon - reverse tunnel multiplexer")]
struct Args {
    /// Config file path (JSON). Defaults to `~/.config/kitemux/config.json`.
    #[arg(long, env = "KITEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Kite to publish, as `proto:domain:port:secret:local_host:local_port`.
    /// An empty port accepts any public port. May be repeated.
    #[arg(long = "kite", env = "KITEMUX_KITES", value_delimiter = ',')]
    kites: Vec<String>,

    /// Frontend relay as `host:port`. May be repeated.
    #[arg(long = "frontend", env = "KITEMUX_FRONTENDS", value_delimiter = ',')]
    frontends: Vec<String>,

    /// Dynamic DNS update URL with three `%s` slots (domain, addresses, signature).
    #[arg(long, env = "KITEMUX_DDNS_URL")]
    ddns_url: Option<String>,

    /// Extra frontends to keep connected beyond the fastest one.
    #[arg(long, env = "KITEMUX_SPARE_FRONTENDS")]
    spare_frontends: Option<usize>,

    /// Blocking worker threads for housekeeping.
    #[arg(long, env = "KITEMUX_WORKERS")]
    workers: Option<usize>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "KITEMUX_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KITEMUX_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(
        &default_filter("kitemux_daemon", &args.log_level),
        args.log_json,
    );

    let mut config = load_config(args.config.as_deref())?;
    for spec in &args.kites {
        config.kites.push(Kite::parse_spec(spec)?);
    }
    for spec in &args.frontends {
        config.frontends.push(FrontendSpec::parse(spec)?);
    }
    if let Some(url) = args.ddns_url {
        config.dynamic_dns_url = Some(url);
    }
    if let Some(spare) = args.spare_frontends {
        config.spare_frontends = spare;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.log_level = args.log_level;
    let config = config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        kites = config.kites.len(),
        frontends = config.frontends.len(),
        workers = config.workers,
        ddns = config.dynamic_dns_url.is_some(),
        "Starting kitemux-daemon"
    );
    if config.kites.is_empty() {
        warn!("No kites configured, tunnels will carry nothing");
    }

    let connector = Arc::new(PageKiteConnector::new(config.app_id.clone()));
    let ctx = Arc::new(Context::new(config)?);
    let added = ctx.add_configured_frontends().await?;
    info!(added, "Front-ends resolved");

    let handle = Manager::spawn(Arc::clone(&ctx), connector);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    handle.stop().await;
    info!(status = ctx.state.status().as_str(), "kitemux-daemon stopped");
    Ok(())
}
