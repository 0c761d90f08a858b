//! # Prometheus Metrics
//!
//! Timing and progress metrics of the consensus engine. All metrics are
//! registered in a dedicated [`prometheus::Registry`] so several engines (one
//! per shard, or one per in-process validator) never collide in a global
//! registry.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::messages::MessageType;

/// Bucket boundaries shared by every duration histogram, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Metric handles of one consensus engine.
///
/// Clone-friendly: prometheus handles are reference counted internally.
#[derive(Clone)]
pub struct ConsensusMetrics {
    registry: Registry,
    /// Wall time of each round, from worker start to teardown.
    pub round_duration_seconds: Histogram,
    /// Wall time of each sequence, from `run_sequence` to return.
    pub sequence_duration_seconds: Histogram,
    /// Time spent in the new round state.
    pub new_round_duration_seconds: Histogram,
    /// Time spent in the prepare state.
    pub prepare_duration_seconds: Histogram,
    /// Time spent in the commit state.
    pub commit_duration_seconds: Histogram,
    /// Time the backend took to build a proposal.
    pub build_proposal_duration_seconds: Histogram,
    /// Time the backend took to insert a finalized proposal.
    pub insert_proposal_duration_seconds: Histogram,
    /// Rounds abandoned because of a timeout, a future proposal, or a future
    /// round change certificate.
    pub round_changes_total: IntCounter,
    /// Heights that reached finality and were handed to the backend.
    pub sequences_committed_total: IntCounter,
    /// Inbound messages accepted into the message store, by `type`.
    pub messages_received_total: IntCounterVec,
    /// Messages handed to the transport, by `type`.
    pub messages_sent_total: IntCounterVec,
    /// Size of the validator set of the height being decided.
    pub validators: IntGauge,
}

impl ConsensusMetrics {
    /// Creates and registers all metrics under the given namespace prefix.
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(namespace.to_string()), None)?;

        let round_duration_seconds =
            register_histogram(&registry, "round_duration_seconds", "Round duration")?;
        let sequence_duration_seconds =
            register_histogram(&registry, "sequence_duration_seconds", "Sequence duration")?;
        let new_round_duration_seconds = register_histogram(
            &registry,
            "new_round_duration_seconds",
            "New round stage duration",
        )?;
        let prepare_duration_seconds = register_histogram(
            &registry,
            "prepare_duration_seconds",
            "Prepare stage duration",
        )?;
        let commit_duration_seconds =
            register_histogram(&registry, "commit_duration_seconds", "Commit stage duration")?;
        let build_proposal_duration_seconds = register_histogram(
            &registry,
            "build_proposal_duration_seconds",
            "Backend proposal building duration",
        )?;
        let insert_proposal_duration_seconds = register_histogram(
            &registry,
            "insert_proposal_duration_seconds",
            "Backend proposal insertion duration",
        )?;

        let round_changes_total = register_counter(
            &registry,
            "round_changes_total",
            "Rounds abandoned before reaching finality",
        )?;
        let sequences_committed_total = register_counter(
            &registry,
            "sequences_committed_total",
            "Heights finalized and inserted",
        )?;
        let messages_received_total = register_counter_vec(
            &registry,
            "messages_received_total",
            "Consensus messages accepted into the message store",
        )?;
        let messages_sent_total = register_counter_vec(
            &registry,
            "messages_sent_total",
            "Consensus messages multicast to the validator set",
        )?;

        let validators = IntGauge::new("validators", "Validators of the current height")?;
        registry.register(Box::new(validators.clone()))?;

        Ok(Self {
            registry,
            round_duration_seconds,
            sequence_duration_seconds,
            new_round_duration_seconds,
            prepare_duration_seconds,
            commit_duration_seconds,
            build_proposal_duration_seconds,
            insert_proposal_duration_seconds,
            round_changes_total,
            sequences_committed_total,
            messages_received_total,
            messages_sent_total,
            validators,
        })
    }

    pub fn message_received(&self, message_type: MessageType) {
        self.messages_received_total
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    pub fn message_sent(&self, message_type: MessageType) {
        self.messages_sent_total
            .with_label_values(&[message_type.as_str()])
            .inc();
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn register_histogram(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<Histogram, prometheus::Error> {
    let histogram =
        Histogram::with_opts(HistogramOpts::new(name, help).buckets(DURATION_BUCKETS.to_vec()))?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

fn register_counter(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Counter with one `type` label, with every message type present at zero.
fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["type"])?;
    for message_type in MessageType::ALL {
        counter.with_label_values(&[message_type.as_str()]);
    }
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
