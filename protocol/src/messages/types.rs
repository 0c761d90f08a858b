//! Consensus message types.
//!
//! A [`ConsensusMessage`] is immutable once signed: the signature covers the
//! view, the sender, and the payload (everything except the signature
//! itself), so any mutation invalidates it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash, Signature, ValidatorId};

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// A `(height, round)` pair identifying one consensus attempt.
///
/// Ordered by height first, then round.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct View {
    /// Block height being agreed on.
    pub height: u64,
    /// Attempt number at that height, starting at 0.
    pub round: u64,
}

impl View {
    pub const fn new(height: u64, round: u64) -> Self {
        Self { height, round }
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.height, self.round)
    }
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// The four message kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Proposal broadcast by the round's proposer.
    PrePrepare,
    /// "I accept this proposal for this round."
    Prepare,
    /// "A quorum prepared this proposal; here is my seal."
    Commit,
    /// "Move to this round; here is what I prepared so far."
    RoundChange,
}

impl MessageType {
    /// All message types, in protocol order.
    pub const ALL: [MessageType; 4] = [
        MessageType::PrePrepare,
        MessageType::Prepare,
        MessageType::Commit,
        MessageType::RoundChange,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrePrepare => "PREPREPARE",
            Self::Prepare => "PREPARE",
            Self::Commit => "COMMIT",
            Self::RoundChange => "ROUND_CHANGE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload building blocks
// ---------------------------------------------------------------------------

/// A proposal as the Backend produced it, plus the round it was proposed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Opaque proposal bytes. Only the Backend knows how to read them.
    pub raw_proposal: Vec<u8>,
    /// Round in which this proposal was made.
    pub round: u64,
}

/// One validator's signature over a proposal hash. A quorum of these is the
/// finality proof handed to the Backend when the block is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSeal {
    /// Validator that produced the seal.
    pub signer: ValidatorId,
    /// Signature over the proposal hash.
    pub signature: Signature,
}

/// Proof that a quorum prepared a specific proposal in some round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    /// The PRE-PREPARE that carried the proposal.
    pub proposal_message: Box<ConsensusMessage>,
    /// The PREPARE messages that, together with the proposer, form a quorum.
    pub prepare_messages: Vec<ConsensusMessage>,
}

/// Proof that a quorum wants to move to a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundChangeCertificate {
    pub round_change_messages: Vec<ConsensusMessage>,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepareData {
    pub proposal: Proposal,
    pub proposal_hash: Hash,
    /// Required for every round above 0.
    pub certificate: Option<RoundChangeCertificate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareData {
    pub proposal_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitData {
    pub proposal_hash: Hash,
    pub committed_seal: CommittedSeal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundChangeData {
    /// The last proposal this validator prepared, if any.
    pub last_prepared_proposal: Option<Proposal>,
    /// The certificate proving that proposal was prepared.
    pub latest_prepared_certificate: Option<PreparedCertificate>,
}

/// Type-specific message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    PrePrepare(PrePrepareData),
    Prepare(PrepareData),
    Commit(CommitData),
    RoundChange(RoundChangeData),
}

// ---------------------------------------------------------------------------
// ConsensusMessage
// ---------------------------------------------------------------------------

/// A signed consensus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub view: View,
    pub from: ValidatorId,
    pub signature: Signature,
    pub payload: Payload,
}

/// The signed portion of a message.
#[derive(Serialize)]
struct UnsignedMessage<'a> {
    view: &'a View,
    from: &'a ValidatorId,
    payload: &'a Payload,
}

impl ConsensusMessage {
    /// Builds an unsigned message. The Backend signs it afterwards.
    pub fn unsigned(view: View, from: ValidatorId, payload: Payload) -> Self {
        Self {
            view,
            from,
            signature: Signature::default(),
            payload,
        }
    }

    /// Which of the four message kinds this is.
    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::PrePrepare(_) => MessageType::PrePrepare,
            Payload::Prepare(_) => MessageType::Prepare,
            Payload::Commit(_) => MessageType::Commit,
            Payload::RoundChange(_) => MessageType::RoundChange,
        }
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&UnsignedMessage {
            view: &self.view,
            from: &self.from,
            payload: &self.payload,
        })
    }

    /// The proposal of a PRE-PREPARE.
    pub fn proposal(&self) -> Option<&Proposal> {
        match &self.payload {
            Payload::PrePrepare(data) => Some(&data.proposal),
            _ => None,
        }
    }

    /// The proposal hash of a PRE-PREPARE.
    pub fn proposal_hash(&self) -> Option<&Hash> {
        match &self.payload {
            Payload::PrePrepare(data) => Some(&data.proposal_hash),
            _ => None,
        }
    }

    /// The hash a PREPARE votes for.
    pub fn prepare_hash(&self) -> Option<&Hash> {
        match &self.payload {
            Payload::Prepare(data) => Some(&data.proposal_hash),
            _ => None,
        }
    }

    /// The hash a COMMIT votes for.
    pub fn commit_hash(&self) -> Option<&Hash> {
        match &self.payload {
            Payload::Commit(data) => Some(&data.proposal_hash),
            _ => None,
        }
    }

    /// The committed seal of a COMMIT.
    pub fn committed_seal(&self) -> Option<&CommittedSeal> {
        match &self.payload {
            Payload::Commit(data) => Some(&data.committed_seal),
            _ => None,
        }
    }

    /// The round change certificate attached to a PRE-PREPARE.
    pub fn round_change_certificate(&self) -> Option<&RoundChangeCertificate> {
        match &self.payload {
            Payload::PrePrepare(data) => data.certificate.as_ref(),
            _ => None,
        }
    }

    /// The last prepared proposal carried by a ROUND-CHANGE.
    pub fn last_prepared_proposal(&self) -> Option<&Proposal> {
        match &self.payload {
            Payload::RoundChange(data) => data.last_prepared_proposal.as_ref(),
            _ => None,
        }
    }

    /// The prepared certificate carried by a ROUND-CHANGE.
    pub fn latest_prepared_certificate(&self) -> Option<&PreparedCertificate> {
        match &self.payload {
            Payload::RoundChange(data) => data.latest_prepared_certificate.as_ref(),
            _ => None,
        }
    }
}
