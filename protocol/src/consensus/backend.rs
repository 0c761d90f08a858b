//! Collaborator capabilities the engine consumes.
//!
//! The engine never builds, signs, verifies, or stores blocks itself. It asks
//! a [`Backend`] to do so and hands finished messages to a [`Transport`].

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::error::{BoxError, TransportError};
use crate::crypto::{Hash, ValidatorId};
use crate::messages::{
    CommittedSeal, ConsensusMessage, PreparedCertificate, Proposal, RoundChangeCertificate, View,
};

/// Block-level capabilities of the node running the engine.
///
/// Message builders return `None` when the node cannot produce the message
/// (signing failed, nothing to propose). The engine treats that as "nothing
/// happened this round" and lets the round time out.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identity of the local validator.
    fn id(&self) -> ValidatorId;

    /// Whether `id` is the proposer of `(height, round)`.
    fn is_proposer(&self, id: &ValidatorId, height: u64, round: u64) -> bool;

    /// Builds a fresh raw proposal for `view`.
    async fn build_proposal(&self, view: View) -> Option<Vec<u8>>;

    fn build_preprepare_message(
        &self,
        raw_proposal: Vec<u8>,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Option<ConsensusMessage>;

    fn build_prepare_message(&self, proposal_hash: Hash, view: View) -> Option<ConsensusMessage>;

    fn build_commit_message(&self, proposal_hash: Hash, view: View) -> Option<ConsensusMessage>;

    fn build_round_change_message(
        &self,
        proposal: Option<Proposal>,
        certificate: Option<PreparedCertificate>,
        view: View,
    ) -> Option<ConsensusMessage>;

    /// Whether the raw proposal content is acceptable as the next block.
    fn is_valid_proposal(&self, raw_proposal: &[u8]) -> bool;

    /// Whether `hash` is the hash of `proposal`.
    fn is_valid_proposal_hash(&self, proposal: &Proposal, hash: &Hash) -> bool;

    /// Whether the sender is a validator and the message signature is theirs.
    fn is_valid_validator(&self, message: &ConsensusMessage) -> bool;

    /// Whether `seal` is a valid validator signature over `proposal_hash`.
    fn is_valid_committed_seal(&self, proposal_hash: &Hash, seal: &CommittedSeal) -> bool;

    /// Appends a finalized proposal to the chain.
    async fn insert_proposal(&self, proposal: Proposal, committed_seals: Vec<CommittedSeal>);

    /// Voting power of every validator at `height`.
    fn get_voting_powers(&self, height: u64) -> Result<BTreeMap<ValidatorId, u64>, BoxError>;
}

/// Best-effort broadcast to every validator, the sender included.
pub trait Transport: Send + Sync {
    fn multicast(&self, message: ConsensusMessage) -> Result<(), TransportError>;
}
