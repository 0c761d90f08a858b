//! # Devnet
//!
//! Runs a whole validator set in this process, height after height, and
//! checks agreement after each one.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use ibft_protocol::config::ConsensusConfig;
use ibft_protocol::consensus::SequenceOutcome;
use ibft_protocol::crypto::{ValidatorId, ValidatorKeypair};
use ibft_protocol::local::LocalCluster;
use ibft_protocol::metrics::ConsensusMetrics;

use crate::cli::DevnetArgs;

const DEFAULT_VALIDATORS: u8 = 4;
const DEFAULT_HEIGHTS: u64 = 10;

/// Contents of the optional JSON config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevnetFile {
    pub consensus: ConsensusConfig,
    pub validators: Option<u8>,
    pub heights: Option<u64>,
    pub offline: Option<u8>,
}

impl DevnetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Fully resolved devnet parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevnetSettings {
    pub validators: u8,
    pub heights: u64,
    pub offline: u8,
    pub consensus: ConsensusConfig,
    pub dump_metrics: bool,
}

impl DevnetSettings {
    /// Flags win over the file, the file wins over the defaults.
    pub fn resolve(args: &DevnetArgs, file: DevnetFile) -> Result<Self> {
        let mut consensus = file.consensus;
        if let Some(ms) = args.base_timeout_ms {
            consensus.base_round_timeout = Duration::from_millis(ms);
        }

        let settings = Self {
            validators: args.validators.or(file.validators).unwrap_or(DEFAULT_VALIDATORS),
            heights: args.heights.or(file.heights).unwrap_or(DEFAULT_HEIGHTS),
            offline: args.offline.or(file.offline).unwrap_or(0),
            consensus,
            dump_metrics: args.dump_metrics,
        };

        ensure!(settings.validators > 0, "a devnet needs at least one validator");
        ensure!(
            settings.offline < settings.validators,
            "cannot take {} of {} validators offline",
            settings.offline,
            settings.validators
        );
        ensure!(
            !settings.consensus.base_round_timeout.is_zero(),
            "base round timeout must be positive"
        );
        Ok(settings)
    }

    /// Faulty validators the set can absorb and still finalize.
    pub fn tolerated_faults(&self) -> u8 {
        (self.validators - 1) / 3
    }
}

/// What a devnet run achieved.
#[derive(Debug, Default)]
pub struct DevnetReport {
    pub finalized_heights: u64,
    pub round_changes: u64,
    pub interrupted: bool,
    pub metrics: Option<String>,
}

/// Runs the devnet until every height is finalized or `shutdown` fires.
pub async fn run(settings: DevnetSettings, shutdown: CancellationToken) -> Result<DevnetReport> {
    if settings.offline > settings.tolerated_faults() {
        tracing::warn!(
            offline = settings.offline,
            tolerated = settings.tolerated_faults(),
            "more validators offline than the set tolerates, no height will finalize"
        );
    }

    let metrics = Arc::new(ConsensusMetrics::new("ibft").context("failed to register metrics")?);
    let keys = (1..=settings.validators)
        .map(|seed| ValidatorKeypair::from_seed(&[seed; 32]))
        .collect();
    let cluster = LocalCluster::with_keypairs(keys, settings.consensus.clone(), Some(metrics.clone()));

    let offline: Vec<ValidatorId> = cluster
        .nodes
        .iter()
        .rev()
        .take(usize::from(settings.offline))
        .map(|node| node.id)
        .collect();
    for id in &offline {
        cluster.network.disconnect(id);
        tracing::info!(validator = %id, "validator offline");
    }

    tracing::info!(
        validators = settings.validators,
        offline = settings.offline,
        heights = settings.heights,
        base_timeout_ms = settings.consensus.base_round_timeout.as_millis() as u64,
        "devnet started"
    );

    let mut report = DevnetReport::default();
    for height in 1..=settings.heights {
        let outcomes = cluster.run_height(height, &shutdown, &offline).await;

        let mut hashes = BTreeSet::new();
        let mut highest_round = 0;
        for (id, outcome) in outcomes {
            match outcome.with_context(|| format!("validator {id} failed at height {height}"))? {
                SequenceOutcome::Committed {
                    round,
                    proposal_hash,
                } => {
                    hashes.insert(proposal_hash);
                    highest_round = highest_round.max(round);
                }
                SequenceOutcome::Cancelled => report.interrupted = true,
            }
        }

        if hashes.len() > 1 {
            bail!("validators diverged at height {height}: {} distinct blocks", hashes.len());
        }
        if report.interrupted {
            tracing::info!(height, "devnet interrupted");
            break;
        }
        if let Some(hash) = hashes.first() {
            tracing::info!(
                height,
                round = highest_round,
                hash = %hex::encode(&hash[..8]),
                "height finalized by every online validator"
            );
            report.finalized_heights = height;
        }
    }

    report.round_changes = metrics.round_changes_total.get();
    if settings.dump_metrics {
        report.metrics = Some(metrics.encode().context("failed to encode metrics")?);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    fn args() -> DevnetArgs {
        DevnetArgs {
            validators: None,
            heights: None,
            base_timeout_ms: None,
            offline: None,
            log_format: LogFormat::Pretty,
            config: None,
            dump_metrics: false,
        }
    }

    #[test]
    fn flags_override_file_and_defaults() {
        let file: DevnetFile = serde_json::from_str(
            r#"{"validators": 7, "heights": 3, "consensus": {"base_round_timeout": 500}}"#,
        )
        .unwrap();
        let settings = DevnetSettings::resolve(
            &DevnetArgs {
                heights: Some(5),
                ..args()
            },
            file,
        )
        .unwrap();

        assert_eq!(settings.validators, 7);
        assert_eq!(settings.heights, 5);
        assert_eq!(settings.offline, 0);
        assert_eq!(settings.consensus.base_round_timeout, Duration::from_millis(500));
        assert_eq!(settings.tolerated_faults(), 2);
    }

    #[test]
    fn rejects_all_validators_offline() {
        let result = DevnetSettings::resolve(
            &DevnetArgs {
                validators: Some(4),
                offline: Some(4),
                ..args()
            },
            DevnetFile::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        assert!(serde_json::from_str::<DevnetFile>(r#"{"validator": 4}"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn devnet_survives_a_silent_validator() {
        let settings = DevnetSettings::resolve(
            &DevnetArgs {
                heights: Some(3),
                offline: Some(1),
                dump_metrics: true,
                ..args()
            },
            DevnetFile::default(),
        )
        .unwrap();

        let report = run(settings, CancellationToken::new()).await.unwrap();

        assert_eq!(report.finalized_heights, 3);
        assert!(!report.interrupted);
        assert!(report
            .metrics
            .unwrap()
            .contains("ibft_sequences_committed_total 9"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_devnet_reports_interruption() {
        let settings = DevnetSettings::resolve(
            &DevnetArgs {
                offline: Some(2),
                ..args()
            },
            DevnetFile::default(),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });

        let report = run(settings, shutdown).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.finalized_heights, 0);
        assert!(report.round_changes > 0);
    }
}
