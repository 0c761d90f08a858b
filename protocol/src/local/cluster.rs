//! A complete in-process validator set.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info_span;

use super::backend::LocalBackend;
use super::transport::{spawn_ingest, LocalNetwork};
use crate::config::ConsensusConfig;
use crate::consensus::{ConsensusError, Ibft, SequenceOutcome};
use crate::crypto::{ValidatorId, ValidatorKeypair};
use crate::metrics::ConsensusMetrics;

/// One validator of a [`LocalCluster`].
pub struct LocalNode {
    pub id: ValidatorId,
    pub backend: Arc<LocalBackend>,
    pub engine: Arc<Ibft>,
    ingest: JoinHandle<()>,
}

/// Validators sharing one [`LocalNetwork`], each with its own backend,
/// engine, and ingestion task. Must be built inside a Tokio runtime.
pub struct LocalCluster {
    pub network: Arc<LocalNetwork>,
    /// Sorted by id, so `nodes[(h + r) % n]` proposes `(h, r)`.
    pub nodes: Vec<LocalNode>,
}

impl LocalCluster {
    /// `size` equal-power validators with deterministic keys.
    pub fn new(size: u8, config: ConsensusConfig) -> Self {
        let keys = (1..=size)
            .map(|seed| ValidatorKeypair::from_seed(&[seed; 32]))
            .collect();
        Self::with_keypairs(keys, config, None)
    }

    pub fn with_keypairs(
        keys: Vec<ValidatorKeypair>,
        config: ConsensusConfig,
        metrics: Option<Arc<ConsensusMetrics>>,
    ) -> Self {
        let ids: Vec<ValidatorId> = keys.iter().map(ValidatorKeypair::id).collect();
        let network = LocalNetwork::new();

        let mut nodes: Vec<LocalNode> = keys
            .into_iter()
            .map(|keypair| {
                let id = keypair.id();
                let backend = Arc::new(LocalBackend::new(keypair, ids.clone()));
                let span = info_span!("validator", id = %id);

                let mut engine = Ibft::new(backend.clone(), Arc::new(network.transport()), span)
                    .with_config(config.clone());
                if let Some(metrics) = &metrics {
                    engine = engine.with_metrics(metrics.clone());
                }
                let engine = Arc::new(engine);

                let ingest = spawn_ingest(network.register(id), engine.clone());
                LocalNode {
                    id,
                    backend,
                    engine,
                    ingest,
                }
            })
            .collect();
        nodes.sort_by_key(|node| node.id);

        Self { network, nodes }
    }

    pub fn node(&self, id: &ValidatorId) -> Option<&LocalNode> {
        self.nodes.iter().find(|node| node.id == *id)
    }

    /// The validator that proposes `(height, round)`.
    pub fn proposer(&self, height: u64, round: u64) -> ValidatorId {
        let n = self.nodes.len() as u128;
        let index = (u128::from(height) + u128::from(round)) % n;
        self.nodes[index as usize].id
    }

    /// Runs `height` on every node not listed in `offline` and collects the
    /// outcomes in node order.
    pub async fn run_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
        offline: &[ValidatorId],
    ) -> Vec<(ValidatorId, Result<SequenceOutcome, ConsensusError>)> {
        let runs = self
            .nodes
            .iter()
            .filter(|node| !offline.contains(&node.id))
            .map(|node| {
                let engine = node.engine.clone();
                let cancel = cancel.clone();
                let id = node.id;
                async move {
                    let outcome = tokio::spawn(async move { engine.run_sequence(height, cancel).await })
                        .await
                        .unwrap_or(Ok(SequenceOutcome::Cancelled));
                    (id, outcome)
                }
            });
        join_all(runs).await
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.ingest.abort();
        }
    }
}
