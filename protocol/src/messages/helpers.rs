//! Free-standing checks over message collections.

use std::collections::HashSet;

use thiserror::Error;

use super::types::{CommittedSeal, ConsensusMessage, MessageType};
use crate::crypto::{Hash, ValidatorId};

/// Raised when seals are requested from something that is not a COMMIT.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("message from {sender} is a {found}, not a COMMIT")]
pub struct NotACommit {
    pub sender: ValidatorId,
    pub found: MessageType,
}

/// The distinct senders of a set of messages.
pub fn senders<'a, I>(messages: I) -> HashSet<ValidatorId>
where
    I: IntoIterator<Item = &'a ConsensusMessage>,
{
    messages.into_iter().map(|msg| msg.from).collect()
}

/// Whether no two messages share a sender.
pub fn has_unique_senders(messages: &[ConsensusMessage]) -> bool {
    if messages.is_empty() {
        return false;
    }
    senders(messages).len() == messages.len()
}

/// Collects the committed seals of a quorum of COMMIT messages.
pub fn extract_committed_seals(
    messages: &[ConsensusMessage],
) -> Result<Vec<CommittedSeal>, NotACommit> {
    messages
        .iter()
        .map(|msg| {
            msg.committed_seal().cloned().ok_or(NotACommit {
                sender: msg.from,
                found: msg.message_type(),
            })
        })
        .collect()
}

/// The hash a message of a prepared certificate vouches for: the proposal
/// hash for the PRE-PREPARE, the prepared hash for each PREPARE.
fn certificate_message_hash(message: &ConsensusMessage) -> Option<&Hash> {
    match message.message_type() {
        MessageType::PrePrepare => message.proposal_hash(),
        MessageType::Prepare => message.prepare_hash(),
        _ => None,
    }
}

/// Structural check of the messages of a prepared certificate.
///
/// All messages must be at `height`, share one round strictly below
/// `round_limit`, vouch for the same proposal hash, and come from distinct
/// senders.
pub fn are_valid_pc_messages(messages: &[ConsensusMessage], height: u64, round_limit: u64) -> bool {
    let Some(first) = messages.first() else {
        return false;
    };
    let round = first.view.round;
    let Some(hash) = certificate_message_hash(first) else {
        return false;
    };

    let mut seen = HashSet::with_capacity(messages.len());
    messages.iter().all(|msg| {
        msg.view.height == height
            && msg.view.round < round_limit
            && msg.view.round == round
            && certificate_message_hash(msg) == Some(hash)
            && seen.insert(msg.from)
    })
}
