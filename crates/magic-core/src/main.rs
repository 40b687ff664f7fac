//! MAGIC Connection Manager Core daemon.
//!
//! - Terminates the Diameter-style client protocol over TCP
//! - Speaks MIH to DLMs over Unix stream/datagram sockets and UDP
//! - Runs the policy engine, push engine and liveness sweepers
//! - SIGINT/SIGTERM stop it cleanly; SIGUSR1 logs a status dump

use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use magic_core::{liveness, north, push, south, Config, CoreState};

/// MAGIC connection manager core daemon.
#[derive(Parser, Debug)]
#[command(name = "magic-core", about = "ARINC 839 connection manager core")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "magic.toml")]
    config: PathBuf,

    /// Log filter override (else RUST_LOG, else "info").
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // A broken configuration is a fatal init failure (non-zero exit).
    let config = Config::load(&cli.config)?;
    tracing::info!(
        config = %cli.config.display(),
        datalinks = config.datalinks.len(),
        clients = config.clients.len(),
        rulesets = config.rulesets.len(),
        "magic-core starting"
    );

    let state = CoreState::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();

    // ── North-bound client listener ─────────────────────────────
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = north::run(state, shutdown).await {
                tracing::error!(error = %e, "north server failed");
            }
        }));
    }

    // ── South-bound MIH transports ──────────────────────────────
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = south::run_stream_server(state, shutdown).await {
                tracing::error!(error = %e, "south stream server failed");
            }
        }));
    }
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = south::run_dgram_server(state, shutdown).await {
                tracing::error!(error = %e, "south datagram server failed");
            }
        }));
    }
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = south::run_heartbeat_listener(state, shutdown).await {
                tracing::error!(error = %e, "UDP heartbeat listener failed");
            }
        }));
    }

    // ── Push engine and sweepers ────────────────────────────────
    {
        let events = state.links().subscribe();
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(push::run_events(state, events, shutdown)));
    }
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(liveness::run_heartbeat_monitor(state, shutdown)));
    }
    {
        let state = state.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(liveness::run_ack_sweeper(state, shutdown)));
    }

    // ── Signals ─────────────────────────────────────────────────
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigusr1.recv() => {
                state.status_dump();
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("magic-core stopped");
    Ok(())
}
