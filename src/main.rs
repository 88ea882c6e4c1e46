// =============================================================================
// Helios — autonomous trading agent for the Solana blockchain
// =============================================================================
//
// The engine starts in dry-run mode for safety. Live trading requires both
// --live and --confirm-live on the command line.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod cli;
mod config;
mod errors;
mod exec;
mod indicators;
mod learner;
mod ledger;
mod llm;
mod market;
mod notify;
mod orchestrator;
mod position_manager;
mod positions;
mod risk;
mod rpc;
mod strategy;
mod types;
mod validator;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::cli::CliArgs;
use crate::config::{SecretStore, Settings};
use crate::orchestrator::Orchestrator;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    let mut settings = match Settings::load("settings.json") {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to load settings");
            return 1;
        }
    };
    args.apply(&mut settings);

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Helios — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        dry_run = settings.dry_run,
        strategy_mode = %settings.strategy_mode,
        scan_interval_secs = settings.scan_interval_secs,
        "configuration resolved"
    );
    if !settings.dry_run {
        warn!("LIVE TRADING ENABLED — real transactions will be signed and sent");
    }

    // ── 2. Secrets, with scrubbing on every exit path ────────────────────
    let secrets = Arc::new(SecretStore::from_env());

    // Scrub on panic too, not only the orderly paths.
    {
        let panic_secrets = secrets.clone();
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            panic_secrets.scrub();
            default_hook(info);
        }));
    }

    // ── 3. Build the service bundle ──────────────────────────────────────
    let state = match AppState::init(settings, secrets.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "startup failed");
            secrets.scrub();
            return 1;
        }
    };

    // ── 4. Orchestrator lifecycle ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut orchestrator = Orchestrator::new(state.clone(), shutdown_rx);

    if let Err(e) = orchestrator.startup().await {
        error!(error = %e, "orchestrator startup failed");
        secrets.scrub();
        return 1;
    }

    let engine = tokio::spawn(async move { orchestrator.run().await });

    // ── 5. Wait for completion or a shutdown signal ──────────────────────
    let exit_code = tokio::select! {
        result = engine => {
            match result {
                Ok(Ok(())) => {
                    info!("engine finished");
                    0
                }
                Ok(Err(e)) => {
                    error!(error = %e, "engine failed");
                    1
                }
                Err(e) => {
                    error!(error = %e, "engine task panicked");
                    1
                }
            }
        }
        _ = shutdown_signal() => {
            warn!("shutdown signal received — stopping gracefully");
            let _ = shutdown_tx.send(true);
            // The orchestrator tears down within its grace window; give it a
            // moment, then leave regardless.
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            0
        }
    };

    secrets.scrub();
    info!("Helios shut down complete.");
    exit_code
}

/// Resolve on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
