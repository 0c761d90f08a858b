// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # IBFT Node
//!
//! Entry point for the `ibft-node` binary. Parses CLI arguments, initializes
//! logging, and runs an in-process validator cluster.
//!
//! The binary supports two subcommands:
//!
//! - `devnet`  - run a local validator set and check agreement per height
//! - `version` - print build version information

mod cli;
mod devnet;
mod logging;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use cli::{Commands, IbftNodeCli};
use devnet::{DevnetFile, DevnetSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = IbftNodeCli::parse();

    match cli.command {
        Commands::Devnet(args) => run_devnet(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runs the devnet until every height is finalized or Ctrl+C is pressed.
async fn run_devnet(args: cli::DevnetArgs) -> Result<()> {
    logging::init_logging("ibft_node=info,ibft_protocol=info", args.log_format)?;

    let file = match &args.config {
        Some(path) => DevnetFile::load(path)?,
        None => DevnetFile::default(),
    };
    let settings = DevnetSettings::resolve(&args, file)?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling sequences");
        trigger.cancel();
    });

    let result = devnet::run(settings, shutdown).await;
    signals.abort();
    let report = result?;

    println!("Devnet finished.");
    println!("  Finalized heights : {}", report.finalized_heights);
    println!("  Round changes     : {}", report.round_changes);
    println!("  Interrupted       : {}", report.interrupted);
    if let Some(metrics) = report.metrics {
        println!();
        print!("{metrics}");
    }

    tracing::info!("ibft-node stopped");
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("ibft-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "round 0   {} ms",
        ibft_protocol::config::ROUND0_TIMEOUT.as_millis()
    );
    println!("rustc     {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
