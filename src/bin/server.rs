//! Braid server
//!
//! Accepts tunnel connections from braid clients, re-establishes peer
//! connections to the configured upstream target and shuttles bytes back.

use anyhow::{anyhow, Context, Result};
use braid::config::Config;
use braid::conn::ConnManager;
use braid::tunnel::{Frame, SharedEgress, TunnelWorker};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

/// Depth of the shared egress/ingress channels
const CHANNEL_DEPTH: usize = 256;

/// Braid server - terminate tunnels and forward to the upstream target
#[derive(Parser, Debug)]
#[command(name = "braid-server")]
#[command(about = "Braid server - terminate tunnels and forward to the upstream target")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address for tunnel connections (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream target address (overrides config)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let server = config
        .server
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    let listen = args.listen.unwrap_or(server.listen);
    let upstream = args.upstream.unwrap_or(server.upstream);

    info!("Braid server v{}", braid::VERSION);
    info!(%upstream, "forwarding created connections");

    let (egress_tx, egress_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let egress: SharedEgress = Arc::new(Mutex::new(egress_rx));
    let (ingress_tx, ingress_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let (cancel_tx, _) = broadcast::channel(1);

    let manager = ConnManager::server(upstream, ingress_rx, egress_tx);
    tokio::spawn(manager.run());

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(%listen, "listening for tunnels");

    let accept_cancel = cancel_tx.clone();
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!(%peer, "tunnel accepted");
                    let worker = TunnelWorker::accept(
                        egress.clone(),
                        ingress_tx.clone(),
                        accept_cancel.clone(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = worker.run_on(stream).await {
                            warn!(%peer, error = %e, "tunnel worker failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
    });

    shutdown_signal().await?;
    info!("shutting down");
    accept_loop.abort();
    let _ = cancel_tx.send(());
    // let workers get their close-tunnel frames onto the wire
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
