//! Portway - HTTP CONNECT proxy
//!
//! Accepts CONNECT requests over TCP and relays each one to its target until
//! either side hangs up or the proxy is stopped.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{ConfigOverrides, ProxyConfig};
use portway_core::{BroadcastObserver, CompositeObserver, ServerObserver, TracingObserver};
use portway_server_tcp::TcpProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portway - relay HTTP CONNECT tunnels
#[derive(Parser, Debug)]
#[command(name = "portway")]
#[command(about = "HTTP CONNECT proxy with tunnel lifecycle tracking", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, env = "PORTWAY_CONFIG")]
    config: Option<PathBuf>,

    /// IPv4 address to listen on (0.0.0.0 for all interfaces)
    #[arg(long, env = "PORTWAY_ADDRESS")]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORTWAY_PORT")]
    port: Option<u16>,

    /// Server type tag reported with lifecycle events
    #[arg(long, env = "PORTWAY_KIND")]
    kind: Option<String>,

    /// Upstream connect timeout in seconds
    #[arg(long, env = "PORTWAY_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// CONNECT handshake timeout in seconds
    #[arg(long, env = "PORTWAY_HANDSHAKE_TIMEOUT")]
    handshake_timeout: Option<u64>,

    /// Seconds to wait for open tunnels to close after stopping
    #[arg(long, env = "PORTWAY_DRAIN_TIMEOUT")]
    drain_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "PORTWAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Print every lifecycle event to stdout as a JSON line
    #[arg(long, env = "PORTWAY_EVENTS_JSON")]
    events_json: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            bind_address: self.address.clone(),
            port: self.port,
            kind: self.kind.clone(),
            connect_timeout_secs: self.connect_timeout,
            handshake_timeout_secs: self.handshake_timeout,
            drain_timeout_secs: self.drain_timeout,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::load_or_default(cli.config.as_deref())?;
    config.apply(cli.overrides());
    config.validate().context("Invalid configuration")?;

    init_logging(&config.log_level)?;

    let observer = build_observer(cli.events_json);
    let server = TcpProxyServer::new(config.server_config()?, Some(observer));

    let addr = server.start()?;
    info!("✅ Portway is listening on {}", addr);
    info!("Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping proxy..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    let closing = server.stop();
    info!("Asked {} open tunnel(s) to close", closing);

    let drain_timeout = config.drain_timeout();
    if server.wait_drained(drain_timeout).await {
        info!("✅ All tunnels closed");
    } else {
        let leaked = server.tunnels();
        warn!(
            "{} tunnel(s) still open after {:?}",
            leaked.len(),
            drain_timeout
        );
        for tunnel in leaked {
            warn!(
                tunnel_id = %tunnel.id,
                peer = ?tunnel.peer_addr,
                target = ?tunnel.target,
                opened = %tunnel.registered_at,
                "Tunnel did not close"
            );
        }
    }

    Ok(())
}

/// Log through tracing, optionally mirroring events to stdout as JSON
fn build_observer(events_json: bool) -> Arc<dyn ServerObserver> {
    if !events_json {
        return Arc::new(TracingObserver);
    }

    let events = BroadcastObserver::new(1024);
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to serialize event: {}", e),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event printer lagged, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    Arc::new(
        CompositeObserver::new()
            .with(Arc::new(TracingObserver))
            .with(Arc::new(events)),
    )
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context(format!("Invalid log level: {:?}", log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}
