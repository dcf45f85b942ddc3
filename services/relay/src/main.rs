//! uniproxy
//!
//! Starts a batch of local SOCKS5 relays and keeps them running until Ctrl-C.

use std::net::IpAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uniproxy_relay::{BatchOutcome, Config, Orchestrator};

/// Multiplex local SOCKS5 ports onto upstream SOCKS5 proxies.
#[derive(Debug, Parser)]
#[command(name = "uniproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upstream proxy as host:port or host:port:username:password.
    #[arg(long, env = "UNIPROXY_PROXY")]
    proxy: Option<String>,

    /// API link returning upstream proxies (takes precedence over --proxy).
    #[arg(long, env = "UNIPROXY_API")]
    api: Option<String>,

    /// First local port.
    #[arg(long, default_value_t = 20000)]
    start_port: u16,

    /// Number of local ports.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Local address to listen on (overrides UNIPROXY_BIND_IP).
    #[arg(long)]
    bind: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(bind) = cli.bind {
        config.supervisor.bind_ip = bind;
    }

    init_tracing(&config);

    info!(
        start_port = cli.start_port,
        count = cli.count,
        bind_ip = %config.supervisor.bind_ip,
        api = cli.api.is_some(),
        "Starting uniproxy"
    );

    let orchestrator = Orchestrator::new(&config).context("Failed to build API client")?;

    let result = orchestrator
        .start_proxies(
            cli.proxy.as_deref(),
            cli.api.as_deref(),
            cli.start_port,
            cli.count,
        )
        .await
        .context("Batch rejected")?;

    match result.outcome() {
        BatchOutcome::Complete => {
            info!(started = result.success_count, "All relays started");
        }
        BatchOutcome::Partial => {
            warn!(
                started = result.success_count,
                failed_ports = ?result.failed_ports,
                "Some relays failed to start"
            );
        }
        BatchOutcome::Failed => {
            error!(
                failed_ports = ?result.failed_ports,
                resolution_error = result.resolution_error.as_deref().unwrap_or(""),
                "No relay started"
            );
            orchestrator.stop_all().await;
            std::process::exit(1);
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    orchestrator.stop_all().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    // Prefer RUST_LOG, fall back to UNIPROXY_LOG_LEVEL.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}
