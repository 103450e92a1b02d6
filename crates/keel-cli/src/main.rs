//! keel CLI entry point.
//!
//! Binary name: `keel`
//!
//! Parses CLI arguments, sets up tracing, resolves configuration, then
//! dispatches to the command handler. Ctrl+C and SIGTERM cancel in-flight
//! runs through a shared token; interrupted runs stay resumable.

mod cli;
mod state;

use clap::Parser;
use keel_observe::tracing_setup::{TracingOptions, init_tracing_with, shutdown_tracing};
use tokio_util::sync::CancellationToken;

use cli::run::Output;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,keel_core=debug",
        _ => "trace",
    };
    let tracing_options = TracingOptions {
        json: cli.log_json,
        enable_otel: cli.otel,
        ..TracingOptions::new(filter)
    };
    if let Err(e) = init_tracing_with(&tracing_options) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, interrupting runs");
        signal_token.cancel();
    });

    let result = dispatch(cli, shutdown).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli, shutdown: CancellationToken) -> anyhow::Result<()> {
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };
    let state = AppState::new(cli.data_dir, cli.config, cli.database);

    match cli.command {
        Commands::Run {
            workflow,
            input,
            run_id,
        } => {
            cli::run::handle_run(
                &state,
                &workflow,
                input.as_deref(),
                run_id.as_deref(),
                shutdown,
                out,
            )
            .await
        }

        Commands::Resume { run_id, workflow } => {
            cli::run::handle_resume(&state, &run_id, &workflow, shutdown, out).await
        }

        Commands::Recover { workflow } => {
            cli::run::handle_recover(&state, &workflow, shutdown, out).await
        }

        Commands::Status { run_id } => {
            let store = state.inspect_store().await?;
            cli::inspect::handle_status(&store, &run_id, out).await
        }

        Commands::Steps { run_id } => {
            let store = state.inspect_store().await?;
            cli::inspect::handle_steps(&store, &run_id, out).await
        }

        Commands::Events { run_id } => {
            let store = state.inspect_store().await?;
            cli::inspect::handle_events(&store, &run_id, out).await
        }

        Commands::Unfinished => {
            let store = state.inspect_store().await?;
            cli::inspect::handle_unfinished(&store, out).await
        }

        Commands::Validate { workflow } => cli::run::handle_validate(&workflow, out),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
