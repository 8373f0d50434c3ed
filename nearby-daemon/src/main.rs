// Nearby daemon: LAN discovery, invitations and encrypted text sessions, driven from stdin.

mod advertiser;
mod browser;
mod config;
mod console;
mod engine;
mod error;
mod link;
mod tasks;

use anyhow::Context;
use nearby_core::{generate_local_identity, LocalPeer, SessionConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::{Command, Engine, EngineSettings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("nearby {}", VERSION);
            return Ok(());
        }
    }

    let config::Loaded { config, warnings } = config::load();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    for w in &warnings {
        warn!("config: {w}");
    }

    let local = generate_local_identity(&config.display_name);
    info!(
        peer = %local.identity(),
        service_type = %config.service_type,
        auto_accept = config.auto_accept,
        "starting"
    );
    let settings = EngineSettings::from(&config);
    let session_config = SessionConfig {
        auto_accept: config.auto_accept,
    };

    let rt = tokio::runtime::Runtime::new().context("tokio runtime")?;
    let result = rt.block_on(run(settings, local, session_config));
    // Stdin is read on a blocking thread that never returns on its own.
    rt.shutdown_background();
    result
}

async fn run(
    settings: EngineSettings,
    local: LocalPeer,
    session_config: SessionConfig,
) -> anyhow::Result<()> {
    let (shell_tx, shell_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let engine = Engine::new(settings, local, session_config, shell_tx.clone());
    let engine_task = tokio::spawn(engine.run(cmd_rx));
    let printer = tokio::spawn(console::print_events(shell_rx));

    tokio::select! {
        _ = console::read_commands(cmd_tx.clone(), shell_tx) => info!("console closed"),
        res = shutdown_signal() => {
            res?;
            info!("shutdown signal");
        }
    }

    let _ = cmd_tx.send(Command::Shutdown);
    engine_task.await.context("engine task")?;
    // Engine is gone, so the shell channel closes and the printer drains.
    printer.await.context("event printer")?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Ctrl+C handler")?;
    }
    Ok(())
}
