//! # CLI Interface
//!
//! Defines the command-line argument structure for `ibft-node` using
//! `clap` derive. Supports two subcommands: `devnet` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// IBFT validator cluster runner.
///
/// Runs a complete validator set inside one process over the in-memory
/// reference backend and transport, and checks that every validator
/// finalizes the same block at every height.
#[derive(Parser, Debug)]
#[command(
    name = "ibft-node",
    about = "IBFT validator cluster runner",
    version,
    propagate_version = true
)]
pub struct IbftNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an in-process validator cluster for a number of heights.
    Devnet(DevnetArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `devnet` subcommand.
///
/// Flags override the config file, which overrides the built-in defaults.
#[derive(Parser, Debug)]
pub struct DevnetArgs {
    /// Number of validators in the cluster.
    #[arg(long, short = 'n', env = "IBFT_VALIDATORS")]
    pub validators: Option<u8>,

    /// Number of heights to finalize, starting at 1.
    #[arg(long, env = "IBFT_HEIGHTS")]
    pub heights: Option<u64>,

    /// Timeout of round 0 in milliseconds. Doubles every round.
    #[arg(long, env = "IBFT_BASE_TIMEOUT_MS")]
    pub base_timeout_ms: Option<u64>,

    /// Number of validators that stay silent for the whole run.
    #[arg(long, env = "IBFT_OFFLINE")]
    pub offline: Option<u8>,

    /// Log output format.
    #[arg(long, value_enum, env = "IBFT_LOG_FORMAT", default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Path to a JSON config file with `consensus`, `validators`, `heights`,
    /// and `offline` keys.
    #[arg(long, short = 'c', env = "IBFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the Prometheus text exposition of the run's metrics on exit.
    #[arg(long)]
    pub dump_metrics: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        IbftNodeCli::command().debug_assert();
    }

    #[test]
    fn devnet_flags_parse() {
        let cli = IbftNodeCli::try_parse_from([
            "ibft-node",
            "devnet",
            "--validators",
            "7",
            "--offline",
            "2",
            "--log-format",
            "json",
            "--dump-metrics",
        ])
        .unwrap();

        let Commands::Devnet(args) = cli.command else {
            panic!("expected devnet subcommand");
        };
        assert_eq!(args.validators, Some(7));
        assert_eq!(args.offline, Some(2));
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(args.dump_metrics);
        assert!(args.heights.is_none());
    }
}
