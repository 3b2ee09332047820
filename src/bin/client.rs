//! Braid client
//!
//! Accepts local TCP connections from user applications and forwards their
//! byte streams through one or more parallel tunnels to a braid server.

use anyhow::{anyhow, Context, Result};
use braid::config::Config;
use braid::conn::ConnManager;
use braid::tunnel::{Frame, RestartPolicy, SharedEgress, TunnelManager};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info};

/// Depth of the shared egress/ingress channels
const CHANNEL_DEPTH: usize = 256;

/// Braid client - multiplex local TCP connections over parallel tunnels
#[derive(Parser, Debug)]
#[command(name = "braid-client")]
#[command(about = "Braid client - multiplex local TCP connections over parallel tunnels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address for user connections (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

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
    let client = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    let listen = args.listen.unwrap_or(client.listen);

    info!("Braid client v{}", braid::VERSION);
    info!(
        mode = ?client.mode,
        locals = client.local_addrs.len(),
        remotes = client.remote_addrs.len(),
        "starting"
    );

    // egress: handlers -> any tunnel worker; ingress: workers -> manager
    let (egress_tx, egress_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let egress: SharedEgress = Arc::new(Mutex::new(egress_rx));
    let (ingress_tx, ingress_rx) = mpsc::channel::<Frame>(CHANNEL_DEPTH);
    let (accept_tx, accept_rx) = mpsc::channel(64);
    let (cancel_tx, _) = broadcast::channel(1);

    let manager = ConnManager::client(accept_rx, ingress_rx, egress_tx);
    tokio::spawn(manager.run());

    let tunnels = TunnelManager::new(
        client.mode,
        client.fanout,
        client.local_addrs,
        client.remote_addrs,
        egress,
        ingress_tx,
        cancel_tx.clone(),
        RestartPolicy {
            max_retries: client.max_retries,
            retry_delay: Duration::from_secs(client.retry_delay_secs),
        },
    );
    tunnels.start().context("Failed to start tunnel workers")?;

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;
    info!(%listen, "listening for user connections");

    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted user connection");
                    if accept_tx.send(stream).await.is_err() {
                        break;
                    }
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
