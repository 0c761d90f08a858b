//! In-memory reference backend.
//!
//! Blocks are `bincode`-encoded [`BlockProposal`]s appended to an in-memory
//! chain. Signatures, validator membership, and committed seals are all
//! verified for real with the validators' Ed25519 keys.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::consensus::{Backend, BoxError};
use crate::crypto::{proposal_hash, seal_digest, Hash, ValidatorId, ValidatorKeypair};
use crate::messages::{
    CommitData, CommittedSeal, ConsensusMessage, Payload, PrePrepareData, PrepareData,
    PreparedCertificate, Proposal, RoundChangeCertificate, RoundChangeData, View,
};

/// Errors of the reference backend. They stay inside the backend: every
/// capability method reports them as `false` or `None` after logging.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to decode proposal: {0}")]
    Decode(#[from] bincode::Error),

    #[error("{0} is not a validator")]
    UnknownValidator(ValidatorId),

    #[error("invalid signature from {0}")]
    InvalidSignature(ValidatorId),

    #[error("proposal for height {got} does not extend height {tip}")]
    WrongHeight { tip: u64, got: u64 },

    #[error("proposal parent does not match the chain tip")]
    WrongParent,
}

/// Decoded content of a raw proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockProposal {
    pub height: u64,
    pub parent_hash: Hash,
    pub proposer: ValidatorId,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl BlockProposal {
    pub fn encode(&self) -> Result<Vec<u8>, BackendError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BackendError> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// A block appended to the local chain together with its finality proof.
#[derive(Debug, Clone)]
pub struct FinalizedBlock {
    pub block: BlockProposal,
    pub hash: Hash,
    /// Round in which the block was finalized.
    pub round: u64,
    pub committed_seals: Vec<CommittedSeal>,
}

/// [`Backend`] over an in-memory chain.
pub struct LocalBackend {
    keypair: ValidatorKeypair,
    /// Sorted by id; drives proposer rotation.
    validators: Vec<ValidatorId>,
    powers: BTreeMap<ValidatorId, u64>,
    chain: RwLock<Vec<FinalizedBlock>>,
    tip: watch::Sender<u64>,
}

impl LocalBackend {
    /// Backend for `keypair` in a set of equal-power `validators`.
    pub fn new(keypair: ValidatorKeypair, mut validators: Vec<ValidatorId>) -> Self {
        validators.sort();
        validators.dedup();
        let powers = validators.iter().map(|id| (*id, 1)).collect();
        let (tip, _) = watch::channel(0);
        Self {
            keypair,
            validators,
            powers,
            chain: RwLock::new(Vec::new()),
            tip,
        }
    }

    /// Height of the last inserted block, 0 for an empty chain.
    pub fn height(&self) -> u64 {
        self.chain.read().last().map_or(0, |b| b.block.height)
    }

    /// Hash of the last inserted block, zero for an empty chain.
    pub fn tip_hash(&self) -> Hash {
        self.chain.read().last().map_or([0u8; 32], |b| b.hash)
    }

    /// The finalized block at `height`.
    pub fn block(&self, height: u64) -> Option<FinalizedBlock> {
        self.chain
            .read()
            .iter()
            .find(|b| b.block.height == height)
            .cloned()
    }

    /// Every finalized block, oldest first.
    pub fn chain(&self) -> Vec<FinalizedBlock> {
        self.chain.read().clone()
    }

    /// Watch channel carrying the chain height after each insertion.
    pub fn subscribe_height(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }

    pub fn validators(&self) -> &[ValidatorId] {
        &self.validators
    }

    fn proposer_at(&self, height: u64, round: u64) -> Option<ValidatorId> {
        let n = self.validators.len() as u128;
        if n == 0 {
            return None;
        }
        let index = (u128::from(height) + u128::from(round)) % n;
        self.validators.get(index as usize).copied()
    }

    fn is_member(&self, id: &ValidatorId) -> bool {
        self.validators.binary_search(id).is_ok()
    }

    /// Signs an unsigned message with the local key.
    fn sign(&self, mut message: ConsensusMessage) -> Option<ConsensusMessage> {
        match message.signing_bytes() {
            Ok(bytes) => {
                message.signature = self.keypair.sign(&bytes);
                Some(message)
            }
            Err(e) => {
                warn!(error = %e, "failed to encode message for signing");
                None
            }
        }
    }

    fn check_proposal(&self, raw_proposal: &[u8]) -> Result<BlockProposal, BackendError> {
        let block = BlockProposal::decode(raw_proposal)?;
        let tip = self.height();
        if block.height != tip + 1 {
            return Err(BackendError::WrongHeight {
                tip,
                got: block.height,
            });
        }
        if block.parent_hash != self.tip_hash() {
            return Err(BackendError::WrongParent);
        }
        if !self.is_member(&block.proposer) {
            return Err(BackendError::UnknownValidator(block.proposer));
        }
        Ok(block)
    }

    fn check_sender(&self, message: &ConsensusMessage) -> Result<(), BackendError> {
        if !self.is_member(&message.from) {
            return Err(BackendError::UnknownValidator(message.from));
        }
        let bytes = message.signing_bytes()?;
        if !message.from.verify(&bytes, &message.signature) {
            return Err(BackendError::InvalidSignature(message.from));
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[async_trait]
impl Backend for LocalBackend {
    fn id(&self) -> ValidatorId {
        self.keypair.id()
    }

    fn is_proposer(&self, id: &ValidatorId, height: u64, round: u64) -> bool {
        self.proposer_at(height, round).as_ref() == Some(id)
    }

    async fn build_proposal(&self, view: View) -> Option<Vec<u8>> {
        let block = BlockProposal {
            height: view.height,
            parent_hash: self.tip_hash(),
            proposer: self.id(),
            timestamp_ms: now_ms(),
            payload: format!("block {} proposed in round {}", view.height, view.round)
                .into_bytes(),
        };
        match block.encode() {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(%view, error = %e, "failed to encode proposal");
                None
            }
        }
    }

    fn build_preprepare_message(
        &self,
        raw_proposal: Vec<u8>,
        certificate: Option<RoundChangeCertificate>,
        view: View,
    ) -> Option<ConsensusMessage> {
        let hash = proposal_hash(&raw_proposal);
        self.sign(ConsensusMessage::unsigned(
            view,
            self.id(),
            Payload::PrePrepare(PrePrepareData {
                proposal: Proposal {
                    raw_proposal,
                    round: view.round,
                },
                proposal_hash: hash,
                certificate,
            }),
        ))
    }

    fn build_prepare_message(&self, proposal_hash: Hash, view: View) -> Option<ConsensusMessage> {
        self.sign(ConsensusMessage::unsigned(
            view,
            self.id(),
            Payload::Prepare(PrepareData { proposal_hash }),
        ))
    }

    fn build_commit_message(&self, proposal_hash: Hash, view: View) -> Option<ConsensusMessage> {
        let committed_seal = CommittedSeal {
            signer: self.id(),
            signature: self.keypair.sign(&seal_digest(&proposal_hash)),
        };
        self.sign(ConsensusMessage::unsigned(
            view,
            self.id(),
            Payload::Commit(CommitData {
                proposal_hash,
                committed_seal,
            }),
        ))
    }

    fn build_round_change_message(
        &self,
        proposal: Option<Proposal>,
        certificate: Option<PreparedCertificate>,
        view: View,
    ) -> Option<ConsensusMessage> {
        self.sign(ConsensusMessage::unsigned(
            view,
            self.id(),
            Payload::RoundChange(RoundChangeData {
                last_prepared_proposal: proposal,
                latest_prepared_certificate: certificate,
            }),
        ))
    }

    fn is_valid_proposal(&self, raw_proposal: &[u8]) -> bool {
        match self.check_proposal(raw_proposal) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "proposal rejected");
                false
            }
        }
    }

    fn is_valid_proposal_hash(&self, proposal: &Proposal, hash: &Hash) -> bool {
        proposal_hash(&proposal.raw_proposal) == *hash
    }

    fn is_valid_validator(&self, message: &ConsensusMessage) -> bool {
        match self.check_sender(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(view = %message.view, error = %e, "message sender rejected");
                false
            }
        }
    }

    fn is_valid_committed_seal(&self, proposal_hash: &Hash, seal: &CommittedSeal) -> bool {
        self.is_member(&seal.signer) && seal.signer.verify(&seal_digest(proposal_hash), &seal.signature)
    }

    async fn insert_proposal(&self, proposal: Proposal, committed_seals: Vec<CommittedSeal>) {
        let hash = proposal_hash(&proposal.raw_proposal);
        let block = match BlockProposal::decode(&proposal.raw_proposal) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "refusing to insert undecodable proposal");
                return;
            }
        };

        let height = block.height;
        {
            let mut chain = self.chain.write();
            if chain.iter().any(|b| b.block.height == height) {
                warn!(height, "block already inserted, ignoring duplicate");
                return;
            }
            info!(
                height,
                round = proposal.round,
                hash = %hex::encode(&hash[..8]),
                seals = committed_seals.len(),
                "block inserted"
            );
            chain.push(FinalizedBlock {
                block,
                hash,
                round: proposal.round,
                committed_seals,
            });
        }
        self.tip.send_replace(height);
    }

    fn get_voting_powers(&self, height: u64) -> Result<BTreeMap<ValidatorId, u64>, BoxError> {
        if self.powers.is_empty() {
            return Err(format!("no validators configured for height {height}").into());
        }
        Ok(self.powers.clone())
    }
}
