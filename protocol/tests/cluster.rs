//! Multi-validator integration tests.
//!
//! Every test runs a full validator set in one process over the local
//! network, on a paused Tokio clock. Round timeouts therefore cost nothing
//! and the interleavings are reproducible.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ibft_protocol::config::ConsensusConfig;
use ibft_protocol::consensus::{Backend, ConsensusError, SequenceOutcome, StateName};
use ibft_protocol::crypto::{Hash, ValidatorId, ValidatorKeypair};
use ibft_protocol::local::{LocalBackend, LocalCluster};
use ibft_protocol::messages::{ConsensusMessage, MessageType, Messages, View};
use ibft_protocol::metrics::ConsensusMetrics;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        base_round_timeout: Duration::from_secs(1),
        additional_timeout: Duration::ZERO,
    }
}

/// `(round, hash)` of every committed outcome, in node order.
fn committed(outcomes: &[(ValidatorId, Result<SequenceOutcome, ConsensusError>)]) -> Vec<(u64, Hash)> {
    outcomes
        .iter()
        .filter_map(|(_, outcome)| match outcome {
            Ok(SequenceOutcome::Committed {
                round,
                proposal_hash,
            }) => Some((*round, *proposal_hash)),
            _ => None,
        })
        .collect()
}

/// Number of stored messages of `message_type` at `view` on `node`.
fn stored(cluster: &LocalCluster, node: usize, view: View, message_type: MessageType) -> usize {
    cluster.nodes[node]
        .engine
        .messages()
        .get_valid_messages(view, message_type, &|_: &ConsensusMessage| true)
        .len()
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        child.cancel();
    });
    token
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn four_validators_finalize_in_round_zero() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());

    let outcomes = cluster.run_height(1, &CancellationToken::new(), &[]).await;
    let commits = committed(&outcomes);

    assert_eq!(commits.len(), 4);
    assert!(commits.iter().all(|(round, _)| *round == 0));
    assert!(commits.windows(2).all(|pair| pair[0].1 == pair[1].1));

    let proposer = cluster.proposer(1, 0);
    for node in &cluster.nodes {
        let block = node.backend.block(1).expect("block 1 is finalized");
        assert_eq!(block.block.proposer, proposer);
        assert_eq!(block.hash, commits[0].1);
        assert!(block.committed_seals.len() >= 3);
        for seal in &block.committed_seals {
            assert!(node.backend.is_valid_committed_seal(&block.hash, seal));
        }
        assert_eq!(node.engine.current_state(), StateName::Fin);
    }
}

#[tokio::test(start_paused = true)]
async fn consecutive_heights_build_one_chain() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());

    for height in 1..=3 {
        let outcomes = cluster.run_height(height, &CancellationToken::new(), &[]).await;
        assert_eq!(committed(&outcomes).len(), 4, "height {height}");
    }

    let reference = cluster.nodes[0].backend.chain();
    assert_eq!(reference.len(), 3);
    for pair in reference.windows(2) {
        assert_eq!(pair[1].block.parent_hash, pair[0].hash);
    }
    for node in &cluster.nodes[1..] {
        let hashes: Vec<Hash> = node.backend.chain().iter().map(|b| b.hash).collect();
        let expected: Vec<Hash> = reference.iter().map(|b| b.hash).collect();
        assert_eq!(hashes, expected);
    }
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn offline_proposer_is_replaced_after_round_change() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());
    let offline = cluster.proposer(1, 0);
    cluster.network.disconnect(&offline);

    let outcomes = cluster
        .run_height(1, &CancellationToken::new(), &[offline])
        .await;
    let commits = committed(&outcomes);

    assert_eq!(commits.len(), 3);
    assert!(commits.iter().all(|(round, _)| *round == 1));
    assert!(commits.windows(2).all(|pair| pair[0].1 == pair[1].1));

    let block = cluster.nodes[2].backend.block(1).expect("block 1 is finalized");
    assert_eq!(block.block.proposer, cluster.proposer(1, 1));
    assert_eq!(block.round, 1);
    assert_eq!(cluster.node(&offline).map(|n| n.backend.height()), Some(0));
}

#[tokio::test(start_paused = true)]
async fn block_prepared_in_round_zero_is_reproposed_after_lost_commits() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());

    let first_proposal: Arc<Mutex<Option<Hash>>> = Arc::new(Mutex::new(None));
    let seen = first_proposal.clone();
    cluster.network.set_filter(move |_, message| {
        if message.view.round != 0 {
            return true;
        }
        match message.message_type() {
            MessageType::PrePrepare => {
                *seen.lock() = message.proposal_hash().copied();
                true
            }
            MessageType::Commit => false,
            _ => true,
        }
    });

    let outcomes = cluster.run_height(1, &CancellationToken::new(), &[]).await;
    let commits = committed(&outcomes);
    let prepared = (*first_proposal.lock()).expect("round 0 had a proposal");

    assert_eq!(commits.len(), 4);
    for (round, hash) in &commits {
        assert!(*round >= 1);
        assert_eq!(*hash, prepared);
    }

    let block = cluster.nodes[0].backend.block(1).expect("block 1 is finalized");
    assert_eq!(block.block.proposer, cluster.proposer(1, 0));
    assert!(block.round >= 1);
}

/// Seven validators, round 0 proposer offline, and one validator whose own
/// round 0 timer would not fire for a very long time.
fn seven_with_a_slow_validator() -> (LocalCluster, ValidatorId, ValidatorId) {
    let cluster = LocalCluster::new(7, fast_config());
    let offline = cluster.proposer(1, 0);
    cluster.network.disconnect(&offline);

    let slow = cluster
        .nodes
        .iter()
        .map(|node| node.id)
        .find(|id| *id != offline && *id != cluster.proposer(1, 1))
        .expect("seven validators");
    if let Some(node) = cluster.node(&slow) {
        node.engine.extend_round_timeout(Duration::from_secs(1000));
    }
    (cluster, offline, slow)
}

fn assert_all_committed_in_round_one(
    outcomes: &[(ValidatorId, Result<SequenceOutcome, ConsensusError>)],
    slow: ValidatorId,
) {
    let commits = committed(outcomes);
    assert_eq!(commits.len(), 6);
    assert!(commits.iter().all(|(round, _)| *round == 1));
    assert!(commits.windows(2).all(|pair| pair[0].1 == pair[1].1));

    let slow_outcome = outcomes.iter().find(|(id, _)| *id == slow).map(|(_, o)| o);
    assert!(matches!(
        slow_outcome,
        Some(Ok(SequenceOutcome::Committed { round: 1, .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn lagging_validator_follows_a_higher_round_change_certificate() {
    init_tracing();
    let (cluster, offline, slow) = seven_with_a_slow_validator();

    let cancel = cancel_after(Duration::from_secs(100));
    let outcomes = cluster.run_height(1, &cancel, &[offline]).await;

    assert_all_committed_in_round_one(&outcomes, slow);
}

#[tokio::test(start_paused = true)]
async fn lagging_validator_follows_a_higher_round_proposal() {
    init_tracing();
    let (cluster, offline, slow) = seven_with_a_slow_validator();
    // Without round changes the only way out of round 0 is the proposal.
    cluster.network.set_filter(move |to, message| {
        *to != slow || message.message_type() != MessageType::RoundChange
    });

    let cancel = cancel_after(Duration::from_secs(100));
    let outcomes = cluster.run_height(1, &cancel, &[offline]).await;

    assert_all_committed_in_round_one(&outcomes, slow);
    let slow_index = cluster
        .nodes
        .iter()
        .position(|node| node.id == slow)
        .expect("slow validator is in the cluster");
    assert_eq!(stored(&cluster, slow_index, View::new(1, 1), MessageType::RoundChange), 0);
}

#[tokio::test(start_paused = true)]
async fn partitioned_validator_does_not_block_the_rest() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());
    let isolated = cluster.nodes[0].id;
    cluster.network.set_filter(move |to, _| *to != isolated);

    let cancel = cancel_after(Duration::from_secs(30));
    let outcomes = cluster.run_height(1, &cancel, &[]).await;

    let commits = committed(&outcomes);
    assert_eq!(commits.len(), 3);
    assert!(commits.windows(2).all(|pair| pair[0].1 == pair[1].1));

    let (_, isolated_outcome) = &outcomes[0];
    assert!(matches!(isolated_outcome, Ok(SequenceOutcome::Cancelled)));
    assert_eq!(cluster.nodes[0].backend.height(), 0);
}

#[tokio::test(start_paused = true)]
async fn lone_validator_never_finalizes_and_honours_cancellation() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());
    let offline: Vec<ValidatorId> = cluster.nodes[1..].iter().map(|n| n.id).collect();

    let cancel = cancel_after(Duration::from_secs(20));
    let outcomes = cluster.run_height(1, &cancel, &offline).await;

    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0].1, Ok(SequenceOutcome::Cancelled)));
    assert_eq!(cluster.nodes[0].backend.height(), 0);
    assert!(cluster.nodes[0].engine.current_view().round >= 1);
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_and_foreign_messages_are_rejected() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());
    let offline = cluster.proposer(1, 0);
    cluster.network.disconnect(&offline);
    cluster
        .run_height(1, &CancellationToken::new(), &[offline])
        .await;

    let observer = &cluster.nodes[2];
    assert_eq!(observer.engine.current_view(), View::new(1, 1));

    let peer = &cluster.nodes[3].backend;
    let hash = [9u8; 32];
    let at = |height, round| {
        peer.build_prepare_message(hash, View::new(height, round))
            .expect("local backend signs prepares")
    };

    assert!(observer.engine.is_acceptable_message(&at(1, 1)));
    assert!(observer.engine.is_acceptable_message(&at(2, 0)));
    assert!(!observer.engine.is_acceptable_message(&at(1, 0)));
    assert!(!observer.engine.is_acceptable_message(&at(0, 5)));

    let keys: Vec<ValidatorKeypair> = (1..=4u8).map(|s| ValidatorKeypair::from_seed(&[s; 32])).collect();
    let outsider = LocalBackend::new(
        ValidatorKeypair::from_seed(&[99; 32]),
        keys.iter().map(ValidatorKeypair::id).collect(),
    );
    let foreign = outsider
        .build_prepare_message(hash, View::new(1, 1))
        .expect("local backend signs prepares");
    assert!(!observer.engine.is_acceptable_message(&foreign));
}

#[tokio::test(start_paused = true)]
async fn messages_two_rounds_behind_are_never_stored() {
    init_tracing();
    let cluster = LocalCluster::new(4, fast_config());
    let offline: Vec<ValidatorId> = cluster.nodes[1..].iter().map(|n| n.id).collect();

    let cancel = cancel_after(Duration::from_secs(20));
    cluster.run_height(1, &cancel, &offline).await;

    let current = cluster.nodes[0].engine.current_view();
    assert!(current.round >= 2);
    let stale = View::new(1, current.round - 2);

    let peer = &cluster.nodes[1].backend;
    let prepare = |view| {
        peer.build_prepare_message([7; 32], view)
            .expect("local backend signs prepares")
    };

    cluster.nodes[0].engine.add_message(prepare(stale));
    assert_eq!(stored(&cluster, 0, stale, MessageType::Prepare), 0);

    cluster.nodes[0].engine.add_message(prepare(current));
    assert_eq!(stored(&cluster, 0, current, MessageType::Prepare), 1);
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shared_metrics_count_every_validator() {
    init_tracing();
    let metrics = Arc::new(ConsensusMetrics::new("ibft_test").unwrap());
    let keys = (1..=4u8).map(|s| ValidatorKeypair::from_seed(&[s; 32])).collect();
    let cluster = LocalCluster::with_keypairs(keys, fast_config(), Some(metrics.clone()));

    cluster.run_height(1, &CancellationToken::new(), &[]).await;

    assert_eq!(metrics.sequences_committed_total.get(), 4);
    assert_eq!(metrics.round_changes_total.get(), 0);
    assert_eq!(metrics.validators.get(), 4);

    // The proposer never prepares its own proposal.
    let sent = |t: MessageType| metrics.messages_sent_total.with_label_values(&[t.as_str()]).get();
    assert_eq!(sent(MessageType::PrePrepare), 1);
    assert_eq!(sent(MessageType::Prepare), 3);
    assert_eq!(sent(MessageType::Commit), 4);
    assert_eq!(sent(MessageType::RoundChange), 0);

    let received = |t: MessageType| {
        metrics
            .messages_received_total
            .with_label_values(&[t.as_str()])
            .get()
    };
    assert!(received(MessageType::Prepare) > 0);
    assert!(received(MessageType::Commit) > 0);

    // Only the round 0 proposer builds, every validator inserts.
    assert_eq!(metrics.build_proposal_duration_seconds.get_sample_count(), 1);
    assert_eq!(metrics.insert_proposal_duration_seconds.get_sample_count(), 4);

    let text = metrics.encode().unwrap();
    assert!(text.contains("ibft_test_sequences_committed_total 4"));
    assert!(text.contains(r#"ibft_test_messages_sent_total{type="PREPREPARE"} 1"#));
}
