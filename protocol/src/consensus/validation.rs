//! # Message Validation
//!
//! Checks applied to proposals and certificates before the engine acts on
//! them. Nothing here touches the sequence state: every function answers a
//! yes/no question from the message itself, the backend, and the validator
//! set of the current height.
//!
//! ## Proposal recovery
//!
//! A proposal for a round above 0 carries a round change certificate. If any
//! ROUND-CHANGE in it carries a prepared certificate, a quorum may already
//! have prepared that proposal, so the new proposal must be the one from the
//! highest prepared round. That rule is what keeps two different blocks from
//! being committed at one height.

use std::collections::HashSet;

use super::backend::Backend;
use super::validator_manager::ValidatorManager;
use crate::crypto::Hash;
use crate::messages::helpers::{are_valid_pc_messages, has_unique_senders, senders};
use crate::messages::{ConsensusMessage, MessageType, PreparedCertificate, Proposal, View};

/// Validation context: the collaborators every check consults.
#[derive(Clone, Copy)]
pub struct Validator<'a> {
    pub backend: &'a dyn Backend,
    pub validators: &'a ValidatorManager,
}

impl<'a> Validator<'a> {
    pub fn new(backend: &'a dyn Backend, validators: &'a ValidatorManager) -> Self {
        Self {
            backend,
            validators,
        }
    }

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------

    /// Entry point for PRE-PREPARE messages of `view`.
    pub fn is_valid_preprepare(&self, message: &ConsensusMessage, view: View) -> bool {
        if view.round == 0 {
            self.validate_proposal0(message, view)
        } else {
            self.validate_proposal(message, view)
        }
    }

    /// Checks shared by every round.
    pub fn validate_proposal_common(&self, message: &ConsensusMessage, view: View) -> bool {
        let (Some(proposal), Some(hash)) = (message.proposal(), message.proposal_hash()) else {
            return false;
        };

        proposal.round == view.round
            && self.backend.is_proposer(&message.from, view.height, view.round)
            && self.backend.is_valid_proposal_hash(proposal, hash)
            && self.backend.is_valid_proposal(&proposal.raw_proposal)
    }

    /// Round 0: no certificate needed.
    pub fn validate_proposal0(&self, message: &ConsensusMessage, view: View) -> bool {
        message.view.round == 0
            && self.validate_proposal_common(message, view)
            && !self.is_local_proposer(view)
    }

    /// Round above 0: the proposal must be backed by a round change
    /// certificate and must re-propose the highest prepared proposal in it.
    pub fn validate_proposal(&self, message: &ConsensusMessage, view: View) -> bool {
        if !self.validate_proposal_common(message, view) {
            return false;
        }
        let (Some(proposal), Some(rcc)) = (message.proposal(), message.round_change_certificate())
        else {
            return false;
        };
        let round_changes = &rcc.round_change_messages;

        if !has_unique_senders(round_changes)
            || !self.validators.has_quorum(&senders(round_changes))
            || self.is_local_proposer(view)
        {
            return false;
        }

        let all_genuine = round_changes.iter().all(|rc| {
            rc.message_type() == MessageType::RoundChange
                && rc.view == view
                && self.backend.is_valid_validator(rc)
        });
        if !all_genuine {
            return false;
        }

        // Highest round among the valid prepared certificates; ties keep the
        // last one seen.
        let mut expected: Option<(u64, Hash)> = None;
        for rc in round_changes {
            let Some(pc) = rc.latest_prepared_certificate() else {
                continue;
            };
            if !self.valid_pc(Some(pc), message.view.round, view.height) {
                continue;
            }
            let Some(hash) = pc.proposal_message.proposal_hash() else {
                continue;
            };
            let round = pc.proposal_message.view.round;
            if expected.map_or(true, |(max, _)| round >= max) {
                expected = Some((round, *hash));
            }
        }

        match expected {
            None => true,
            Some((max_round, hash)) => self.backend.is_valid_proposal_hash(
                &Proposal {
                    raw_proposal: proposal.raw_proposal.clone(),
                    round: max_round,
                },
                &hash,
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Certificates
    // -----------------------------------------------------------------------

    /// Prepared certificate check. A missing certificate is valid.
    ///
    /// Every message must be at `height` in one round strictly below
    /// `round_limit`, vouch for the same hash, and come from a distinct
    /// validator. The PRE-PREPARE must come from that round's proposer and
    /// no PREPARE may.
    pub fn valid_pc(
        &self,
        certificate: Option<&PreparedCertificate>,
        round_limit: u64,
        height: u64,
    ) -> bool {
        let Some(certificate) = certificate else {
            return true;
        };
        let proposal = certificate.proposal_message.as_ref();
        let prepares = &certificate.prepare_messages;

        let mut all_messages = Vec::with_capacity(prepares.len() + 1);
        all_messages.push(proposal.clone());
        all_messages.extend(prepares.iter().cloned());

        let all_senders: HashSet<_> = senders(&all_messages);
        if !self.validators.has_quorum(&all_senders) {
            return false;
        }

        if proposal.message_type() != MessageType::PrePrepare
            || prepares.iter().any(|msg| msg.message_type() != MessageType::Prepare)
        {
            return false;
        }

        if !are_valid_pc_messages(&all_messages, height, round_limit) {
            return false;
        }

        if !self
            .backend
            .is_proposer(&proposal.from, proposal.view.height, proposal.view.round)
            || !self.backend.is_valid_validator(proposal)
        {
            return false;
        }

        prepares.iter().all(|msg| {
            self.backend.is_valid_validator(msg)
                && !self
                    .backend
                    .is_proposer(&msg.from, msg.view.height, msg.view.round)
        })
    }

    /// Whether every hash in `certificate` is the hash of `proposal`.
    ///
    /// Both absent is fine; a certificate without a proposal, or the other
    /// way around, is not.
    pub fn proposal_matches_certificate(
        &self,
        proposal: Option<&Proposal>,
        certificate: Option<&PreparedCertificate>,
    ) -> bool {
        match (proposal, certificate) {
            (None, None) => true,
            (Some(proposal), Some(certificate)) => {
                let Some(proposal_hash) = certificate.proposal_message.proposal_hash() else {
                    return false;
                };
                std::iter::once(Some(proposal_hash))
                    .chain(certificate.prepare_messages.iter().map(|m| m.prepare_hash()))
                    .all(|hash| {
                        hash.is_some_and(|hash| self.backend.is_valid_proposal_hash(proposal, hash))
                    })
            }
            _ => false,
        }
    }

    /// Validity of one ROUND-CHANGE for certificate assembly at `height`.
    pub fn is_valid_round_change(&self, message: &ConsensusMessage, height: u64) -> bool {
        let certificate = message.latest_prepared_certificate();
        self.valid_pc(certificate, message.view.round, height)
            && self.proposal_matches_certificate(message.last_prepared_proposal(), certificate)
    }

    fn is_local_proposer(&self, view: View) -> bool {
        self.backend
            .is_proposer(&self.backend.id(), view.height, view.round)
    }
}

/// The raw proposal to re-propose from a round change certificate: the
/// last prepared proposal carried next to the highest-round prepared
/// certificate, if any.
pub fn highest_prepared_proposal(round_changes: &[ConsensusMessage]) -> Option<Vec<u8>> {
    let mut best: Option<(u64, &Proposal)> = None;
    for msg in round_changes {
        let Some(pc) = msg.latest_prepared_certificate() else {
            continue;
        };
        let Some(pc_proposal) = pc.proposal_message.proposal() else {
            continue;
        };
        let round = pc_proposal.round;
        if best.is_some_and(|(max, _)| round <= max) {
            continue;
        }
        let Some(last_prepared) = msg.last_prepared_proposal() else {
            continue;
        };
        best = Some((round, last_prepared));
    }
    best.map(|(_, proposal)| proposal.raw_proposal.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
