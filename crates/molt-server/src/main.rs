//! Molt Server: a TCP server that restarts without dropping connections.
//!
//! Send `SIGHUP` to start a new generation from the same executable on the
//! same listening socket; the old generation drains and exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use molt_ecdysis::{
    bootstrap, listen_for_signals, DrainOutcome, ListenerSource, Orchestrator, SuccessorCommand,
    Termination, Trigger,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

mod config;
mod handlers;
mod pidfile;
mod telemetry;

use config::{Overrides, ServerConfig};
use handlers::Handler;
use pidfile::PidFile;

/// TCP server with zero-downtime restarts.
#[derive(Parser, Debug)]
#[command(name = "molt-server", version, about, long_about = None)]
struct Cli {
    /// Config file (default: molt.toml, optional)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listener network: tcp, tcp4 or tcp6
    #[arg(long)]
    network: Option<String>,

    /// Listener address, e.g. 127.0.0.1:8080
    #[arg(short, long)]
    address: Option<String>,

    /// Write the serving generation's pid here
    #[arg(long)]
    pid_file: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            config_file: self.config.clone(),
            network: self.network.clone(),
            address: self.address.clone(),
            pid_file: self.pid_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // First thing: a successor can be sent SIGHUP as soon as it exists, and
    // the default disposition would kill it after its predecessor let go of
    // the listener.
    let triggers = listen_for_signals()?;

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.overrides())?;
    telemetry::init(config.logging.format)?;

    let source = ListenerSource::from_env();
    let span = info_span!("generation", pid = std::process::id());

    if let Err(e) = run(config, source, triggers).instrument(span).await {
        error!(error = ?e, "Molt server failed");
        return Err(e);
    }
    Ok(())
}

async fn run(
    config: ServerConfig,
    source: ListenerSource,
    triggers: mpsc::Receiver<Trigger>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), ?source, "Molt server starting");
    config.log_config();

    let server = bootstrap(
        source,
        config.network()?,
        &config.listener.address,
        Handler::from_config(&config),
    )
    .context("failed to set up listener")?;
    let server = Arc::new(
        server
            .with_backlog(config.listener.backlog)
            .with_drain_timeout(config.drain_timeout()),
    );

    let command =
        SuccessorCommand::current_process().context("failed to resolve current executable")?;

    let cancel = CancellationToken::new();
    let mut serve = tokio::spawn(
        {
            let server = Arc::clone(&server);
            let cancel = cancel.clone();
            async move { server.serve(cancel).await }
        }
        .in_current_span(),
    );

    tokio::select! {
        listener = server.wait_listening() => {
            info!(address = %listener.local_addr(), origin = ?listener.origin(), "Serving");
        }
        result = &mut serve => {
            let err = match result? {
                Ok(()) => anyhow::anyhow!("accept loop exited before listening"),
                Err(e) => e.into(),
            };
            return Err(err.context("server failed to start"));
        }
    }

    let pid_file = config
        .process
        .pid_file
        .as_ref()
        .map(|path| PidFile::write(path, std::process::id()))
        .transpose()
        .context("failed to write PID file")?;

    let orchestrator = Orchestrator::new(Arc::clone(&server), command, cancel.clone())
        .with_terminate_policy(config.shutdown.on_terminate.into());
    let orchestrate = orchestrator.run(triggers);
    tokio::pin!(orchestrate);

    let termination = tokio::select! {
        termination = &mut orchestrate => termination,
        result = &mut serve => match result? {
            Err(e) if !e.is_shutdown() => {
                error!(error = %e, "Accept loop failed, shutting down");
                cancel.cancel();
                server.stop().await;
                if let Some(pid_file) = pid_file {
                    pid_file.release();
                }
                return Err(e).context("accept loop failed");
            }
            _ => (&mut orchestrate).await,
        },
    };

    match termination {
        Termination::Handoff { successor, drain } => {
            info!(successor_pid = successor.pid, ?drain, "Handed off to successor, exiting");
        }
        Termination::Shutdown { drain } => {
            info!(?drain, "Shut down, exiting");
            if let Some(pid_file) = pid_file {
                pid_file.release();
            }
        }
    }

    if let DrainOutcome::TimedOut { remaining } = termination.drain() {
        warn!(remaining, "Exiting with unfinished connections");
    }
    Ok(())
}
