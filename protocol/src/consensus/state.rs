//! Per-height sequence state.
//!
//! [`SequenceState`] is owned by the sequence loop and mutated only by the
//! round runner of the current round. The ingestion path needs a few facts
//! about it (current view, state name, accepted proposal) to decide whether
//! an inbound message is acceptable and whether it completes a quorum. Every
//! mutator republishes those facts into a shared [`StateSnapshot`].

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::Hash;
use crate::messages::{CommittedSeal, ConsensusMessage, PreparedCertificate, Proposal, View};

/// Sub-state of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateName {
    /// Waiting for a valid PRE-PREPARE.
    #[default]
    NewRound,
    /// Proposal accepted, waiting for a PREPARE quorum.
    Prepare,
    /// Prepared, waiting for a COMMIT quorum.
    Commit,
    /// Committed seals collected; the round is done.
    Fin,
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewRound => "new_round",
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Fin => "fin",
        };
        f.write_str(name)
    }
}

/// Read-only view of the sequence state for concurrent readers.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub view: View,
    pub name: StateName,
    pub proposal_message: Option<ConsensusMessage>,
}

pub type SharedSnapshot = Arc<RwLock<StateSnapshot>>;

/// Mutable state of one height.
#[derive(Debug)]
pub struct SequenceState {
    view: View,
    name: StateName,
    /// The accepted PRE-PREPARE of the current round.
    proposal_message: Option<ConsensusMessage>,
    /// The last certificate this node assembled, carried into round changes.
    latest_pc: Option<PreparedCertificate>,
    latest_prepared_proposal: Option<Proposal>,
    committed_seals: Vec<CommittedSeal>,
    /// Set once the round's runner has started, or a future proposal was
    /// adopted directly into the prepare state.
    round_started: bool,
    shared: SharedSnapshot,
}

impl SequenceState {
    pub fn new(shared: SharedSnapshot) -> Self {
        Self {
            view: View::default(),
            name: StateName::NewRound,
            proposal_message: None,
            latest_pc: None,
            latest_prepared_proposal: None,
            committed_seals: Vec::new(),
            round_started: false,
            shared,
        }
    }

    /// Clears everything and positions the state at round 0 of `height`.
    pub fn reset(&mut self, height: u64) {
        self.view = View::new(height, 0);
        self.name = StateName::NewRound;
        self.proposal_message = None;
        self.latest_pc = None;
        self.latest_prepared_proposal = None;
        self.committed_seals.clear();
        self.round_started = false;
        self.publish();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn view(&self) -> View {
        self.view
    }

    pub fn height(&self) -> u64 {
        self.view.height
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn name(&self) -> StateName {
        self.name
    }

    pub fn round_started(&self) -> bool {
        self.round_started
    }

    pub fn proposal_message(&self) -> Option<&ConsensusMessage> {
        self.proposal_message.as_ref()
    }

    /// The proposal of the accepted PRE-PREPARE.
    pub fn proposal(&self) -> Option<&Proposal> {
        self.proposal_message.as_ref().and_then(ConsensusMessage::proposal)
    }

    /// The hash announced by the accepted PRE-PREPARE.
    pub fn proposal_hash(&self) -> Option<Hash> {
        self.proposal_message
            .as_ref()
            .and_then(ConsensusMessage::proposal_hash)
            .copied()
    }

    pub fn latest_pc(&self) -> Option<&PreparedCertificate> {
        self.latest_pc.as_ref()
    }

    pub fn latest_prepared_proposal(&self) -> Option<&Proposal> {
        self.latest_prepared_proposal.as_ref()
    }

    pub fn committed_seals(&self) -> &[CommittedSeal] {
        &self.committed_seals
    }

    // -----------------------------------------------------------------------
    // Mutators
    // -----------------------------------------------------------------------

    /// Enters the new round state unless the round was already started.
    pub fn new_round(&mut self) {
        if !self.round_started {
            self.name = StateName::NewRound;
            self.round_started = true;
            self.publish();
        }
    }

    pub fn change_state(&mut self, name: StateName) {
        self.name = name;
        self.publish();
    }

    pub fn set_round_started(&mut self, started: bool) {
        self.round_started = started;
    }

    /// Accepts a proposal and enters the prepare state.
    pub fn accept_proposal(&mut self, message: ConsensusMessage) {
        self.proposal_message = Some(message);
        self.name = StateName::Prepare;
        self.publish();
    }

    /// Jumps to `round` of the current height with a clean slate. The latest
    /// prepared certificate survives.
    pub fn move_to_new_round(&mut self, round: u64) {
        self.view = View::new(self.view.height, round);
        self.round_started = false;
        self.proposal_message = None;
        self.name = StateName::NewRound;
        self.publish();
    }

    /// Records the certificate of a completed prepare phase.
    pub fn finalize_prepare(&mut self, certificate: PreparedCertificate, proposal: Proposal) {
        self.latest_pc = Some(certificate);
        self.latest_prepared_proposal = Some(proposal);
        self.name = StateName::Commit;
        self.publish();
    }

    pub fn set_committed_seals(&mut self, seals: Vec<CommittedSeal>) {
        self.committed_seals = seals;
    }

    fn publish(&self) {
        let mut shared = self.shared.write();
        shared.view = self.view;
        shared.name = self.name;
        shared.proposal_message = self.proposal_message.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ValidatorKeypair;
    use crate::messages::{Payload, PrePrepareData};

    fn preprepare(view: View) -> ConsensusMessage {
        ConsensusMessage::unsigned(
            view,
            ValidatorKeypair::from_seed(&[1; 32]).id(),
            Payload::PrePrepare(PrePrepareData {
                proposal: Proposal {
                    raw_proposal: b"block".to_vec(),
                    round: view.round,
                },
                proposal_hash: [7; 32],
                certificate: None,
            }),
        )
    }

    fn state() -> (SequenceState, SharedSnapshot) {
        let shared = SharedSnapshot::default();
        (SequenceState::new(shared.clone()), shared)
    }

    #[test]
    fn reset_clears_everything() {
        let (mut state, shared) = state();
        state.reset(4);
        state.accept_proposal(preprepare(View::new(4, 0)));
        state.set_committed_seals(vec![]);
        state.move_to_new_round(3);

        state.reset(5);
        assert_eq!(state.view(), View::new(5, 0));
        assert_eq!(state.name(), StateName::NewRound);
        assert!(state.proposal_message().is_none());
        assert!(state.latest_pc().is_none());
        assert!(!state.round_started());
        assert_eq!(shared.read().view, View::new(5, 0));
    }

    #[test]
    fn mutations_are_published() {
        let (mut state, shared) = state();
        state.reset(1);
        state.accept_proposal(preprepare(View::new(1, 0)));

        let snapshot = shared.read().clone();
        assert_eq!(snapshot.name, StateName::Prepare);
        assert!(snapshot.proposal_message.is_some());
        assert_eq!(state.proposal_hash(), Some([7; 32]));
    }

    #[test]
    fn new_round_respects_adopted_proposal() {
        let (mut state, _) = state();
        state.reset(1);
        state.move_to_new_round(2);
        state.accept_proposal(preprepare(View::new(1, 2)));
        state.set_round_started(true);

        state.new_round();
        assert_eq!(state.name(), StateName::Prepare);
    }

    #[test]
    fn round_change_keeps_prepared_certificate() {
        let (mut state, _) = state();
        state.reset(1);
        let msg = preprepare(View::new(1, 0));
        state.accept_proposal(msg.clone());
        let proposal = state.proposal().cloned().unwrap();
        state.finalize_prepare(
            PreparedCertificate {
                proposal_message: Box::new(msg),
                prepare_messages: vec![],
            },
            proposal,
        );
        assert_eq!(state.name(), StateName::Commit);

        state.move_to_new_round(1);
        assert!(state.proposal_message().is_none());
        assert!(state.latest_pc().is_some());
        assert!(state.latest_prepared_proposal().is_some());
    }
}
