//! # Validator Set & Quorum Arithmetic
//!
//! At the start of every height the engine asks the backend for the voting
//! power of each validator and freezes the result in a [`ValidatorSet`].
//! Every quorum decision of that height is taken against that snapshot.
//!
//! ## Quorum
//!
//! With total voting power `T`, a set of senders has quorum when its combined
//! power reaches `floor(2T / 3) + 1`, i.e. strictly more than two thirds.
//! For equal-power sets this is the classic `n - f` with `f = (n - 1) / 3`:
//! 3 of 4, 5 of 7, 67 of 100.
//!
//! ## Proposer rotation
//!
//! Validators are sorted by id, and the proposer of `(height, round)` is the
//! validator at index `(height + round) mod n`. Sorting makes the rotation
//! independent of the order in which the backend reported the powers.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::backend::Backend;
use super::error::ConsensusError;
use super::state::StateName;
use crate::crypto::ValidatorId;
use crate::messages::helpers::senders;
use crate::messages::ConsensusMessage;

// ---------------------------------------------------------------------------
// ValidatorSet
// ---------------------------------------------------------------------------

/// Validators and voting powers of one height. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    /// Voting power by validator, iterated in id order.
    powers: BTreeMap<ValidatorId, u64>,
    total_power: u128,
    quorum_size: u128,
}

impl ValidatorSet {
    /// Builds a set from reported voting powers. Zero-power validators are
    /// kept out of the set.
    pub fn new(height: u64, powers: BTreeMap<ValidatorId, u64>) -> Result<Self, ConsensusError> {
        let powers: BTreeMap<ValidatorId, u64> =
            powers.into_iter().filter(|(_, power)| *power > 0).collect();
        let total_power: u128 = powers.values().map(|power| u128::from(*power)).sum();
        if total_power == 0 {
            return Err(ConsensusError::EmptyValidatorSet { height });
        }

        Ok(Self {
            powers,
            total_power,
            quorum_size: calculate_quorum(total_power),
        })
    }

    /// Equal-power set, one vote per validator.
    pub fn with_equal_power<I>(height: u64, validators: I) -> Result<Self, ConsensusError>
    where
        I: IntoIterator<Item = ValidatorId>,
    {
        Self::new(height, validators.into_iter().map(|id| (id, 1)).collect())
    }

    pub fn len(&self) -> usize {
        self.powers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.powers.is_empty()
    }

    pub fn total_power(&self) -> u128 {
        self.total_power
    }

    /// Minimum voting power that constitutes a quorum.
    pub fn quorum_size(&self) -> u128 {
        self.quorum_size
    }

    /// Validator ids in rotation order.
    pub fn validators(&self) -> impl Iterator<Item = &ValidatorId> {
        self.powers.keys()
    }

    /// Combined voting power of a set of senders. Unknown senders add nothing.
    pub fn voting_power(&self, senders: &HashSet<ValidatorId>) -> u128 {
        senders
            .iter()
            .filter_map(|id| self.powers.get(id))
            .map(|power| u128::from(*power))
            .sum()
    }

    /// Whether the senders together hold a quorum of voting power.
    pub fn has_quorum(&self, senders: &HashSet<ValidatorId>) -> bool {
        !senders.is_empty() && self.voting_power(senders) >= self.quorum_size
    }

    /// The proposer of `(height, round)`.
    pub fn proposer(&self, height: u64, round: u64) -> Option<ValidatorId> {
        let n = self.powers.len() as u128;
        if n == 0 {
            return None;
        }
        let index = (u128::from(height) + u128::from(round)) % n;
        self.powers.keys().nth(index as usize).copied()
    }
}

/// `floor(2T / 3) + 1`.
pub fn calculate_quorum(total_power: u128) -> u128 {
    total_power * 2 / 3 + 1
}

// ---------------------------------------------------------------------------
// ValidatorManager
// ---------------------------------------------------------------------------

/// Resolves and holds the validator set of the height being decided.
///
/// Shared between the round workers and the ingestion path. The set is
/// replaced once per height by [`init`](Self::init) and only read afterwards.
pub struct ValidatorManager {
    backend: Arc<dyn Backend>,
    current: RwLock<Option<Arc<ValidatorSet>>>,
}

impl ValidatorManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            current: RwLock::new(None),
        }
    }

    /// Resolves voting powers for `height`.
    ///
    /// On failure the previous set is cleared, so no quorum can be reached
    /// until a later `init` succeeds.
    pub fn init(&self, height: u64) -> Result<(), ConsensusError> {
        let resolved = self
            .backend
            .get_voting_powers(height)
            .map_err(|source| ConsensusError::VotingPowers { height, source })
            .and_then(|powers| ValidatorSet::new(height, powers));

        match resolved {
            Ok(set) => {
                debug!(
                    height,
                    validators = set.len(),
                    total_power = %set.total_power(),
                    quorum = %set.quorum_size(),
                    "validator set resolved"
                );
                *self.current.write() = Some(Arc::new(set));
                Ok(())
            }
            Err(e) => {
                *self.current.write() = None;
                Err(e)
            }
        }
    }

    /// The set resolved by the last successful `init`.
    pub fn validator_set(&self) -> Option<Arc<ValidatorSet>> {
        self.current.read().clone()
    }

    pub fn has_quorum(&self, senders: &HashSet<ValidatorId>) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|set| set.has_quorum(senders))
    }

    /// Prepare quorum check.
    ///
    /// The proposer never sends a PREPARE for its own proposal, so it is
    /// counted once implicitly. A PREPARE from the proposer itself means
    /// something is off and the check fails.
    pub fn has_prepare_quorum(
        &self,
        state: StateName,
        proposal_message: Option<&ConsensusMessage>,
        prepare_messages: &[ConsensusMessage],
    ) -> bool {
        let Some(proposal_message) = proposal_message else {
            // Prepares can legitimately arrive before the proposal; only the
            // prepare state must always have one.
            if state == StateName::Prepare {
                error!("prepare quorum checked without an accepted proposal");
            }
            return false;
        };

        let proposer = proposal_message.from;
        if prepare_messages.iter().any(|msg| msg.from == proposer) {
            error!(%proposer, "proposer is among the prepare senders");
            return false;
        }

        let mut senders = senders(prepare_messages);
        senders.insert(proposer);
        self.has_quorum(&senders)
    }

    /// Quorum size of the current set, 0 before the first `init`.
    pub fn quorum_size(&self) -> u128 {
        self.current
            .read()
            .as_ref()
            .map_or(0, |set| set.quorum_size())
    }

    /// Proposer of `(height, round)` in the current set.
    pub fn proposer(&self, height: u64, round: u64) -> Option<ValidatorId> {
        self.current
            .read()
            .as_ref()
            .and_then(|set| set.proposer(height, round))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ValidatorKeypair;
    use crate::local::LocalBackend;
    use crate::messages::{Payload, PrepareData, View};

    fn ids(n: u8) -> Vec<ValidatorId> {
        (1..=n)
            .map(|seed| ValidatorKeypair::from_seed(&[seed; 32]).id())
            .collect()
    }

    fn prepare(from: ValidatorId) -> ConsensusMessage {
        ConsensusMessage::unsigned(
            View::new(5, 0),
            from,
            Payload::Prepare(PrepareData {
                proposal_hash: [0xAA; 32],
            }),
        )
    }

    #[test]
    fn quorum_threshold_calculation() {
        assert_eq!(calculate_quorum(1), 1);
        assert_eq!(calculate_quorum(3), 3);
        assert_eq!(calculate_quorum(4), 3);
        assert_eq!(calculate_quorum(6), 5);
        assert_eq!(calculate_quorum(7), 5);
        assert_eq!(calculate_quorum(100), 67);
    }

    #[test]
    fn four_equal_validators_need_three() {
        let validators = ids(4);
        let set = ValidatorSet::with_equal_power(1, validators.clone()).unwrap();

        let two: HashSet<_> = validators[..2].iter().copied().collect();
        let three: HashSet<_> = validators[..3].iter().copied().collect();
        assert!(!set.has_quorum(&two));
        assert!(set.has_quorum(&three));
        assert!(!set.has_quorum(&HashSet::new()));
    }

    #[test]
    fn seven_equal_validators_need_five() {
        let validators = ids(7);
        let set = ValidatorSet::with_equal_power(1, validators.clone()).unwrap();

        let four: HashSet<_> = validators[..4].iter().copied().collect();
        let five: HashSet<_> = validators[..5].iter().copied().collect();
        assert!(!set.has_quorum(&four));
        assert!(set.has_quorum(&five));
    }

    #[test]
    fn weighted_quorum_counts_power_not_heads() {
        let validators = ids(4);
        let powers: BTreeMap<_, _> = validators
            .iter()
            .copied()
            .zip([10u64, 1, 1, 1])
            .collect();
        let set = ValidatorSet::new(1, powers).unwrap();
        assert_eq!(set.quorum_size(), 9);

        let whale: HashSet<_> = [validators[0]].into_iter().collect();
        let minnows: HashSet<_> = validators[1..].iter().copied().collect();
        assert!(set.has_quorum(&whale));
        assert!(!set.has_quorum(&minnows));
    }

    #[test]
    fn unknown_senders_add_no_power() {
        let validators = ids(4);
        let set = ValidatorSet::with_equal_power(1, validators[..3].iter().copied()).unwrap();
        let with_stranger: HashSet<_> = [validators[0], validators[3]].into_iter().collect();
        assert!(!set.has_quorum(&with_stranger));
    }

    #[test]
    fn empty_or_powerless_set_rejected() {
        assert!(matches!(
            ValidatorSet::new(3, BTreeMap::new()),
            Err(ConsensusError::EmptyValidatorSet { height: 3 })
        ));
        let zero: BTreeMap<_, _> = ids(2).into_iter().map(|id| (id, 0)).collect();
        assert!(ValidatorSet::new(3, zero).is_err());
    }

    #[test]
    fn proposer_rotation_is_deterministic_and_cycles() {
        let validators = ids(4);
        let mut sorted = validators.clone();
        sorted.sort();
        let set = ValidatorSet::with_equal_power(10, validators).unwrap();

        assert_eq!(set.proposer(10, 0), set.proposer(10, 0));
        assert_eq!(set.proposer(10, 0), Some(sorted[10 % 4]));
        for round in 0..8 {
            assert_eq!(set.proposer(10, round), set.proposer(10, round + 4));
        }

        let first_cycle: HashSet<_> = (0..4).filter_map(|r| set.proposer(10, r)).collect();
        assert_eq!(first_cycle.len(), 4);
    }

    #[test]
    fn proposer_rotation_handles_extreme_views() {
        let set = ValidatorSet::with_equal_power(1, ids(3)).unwrap();
        assert!(set.proposer(u64::MAX, u64::MAX).is_some());
    }

    /// Prepare quorum with the proposer counted implicitly.
    #[test]
    fn prepare_quorum_counts_proposer_once() {
        let validators = ids(4);
        let backend = LocalBackend::new(ValidatorKeypair::from_seed(&[1; 32]), validators.clone());
        let manager = ValidatorManager::new(Arc::new(backend));
        manager.init(5).unwrap();
        assert_eq!(manager.quorum_size(), 3);

        let proposal = prepare(validators[0]);
        let one = vec![prepare(validators[1])];
        let two = vec![prepare(validators[1]), prepare(validators[2])];

        assert!(!manager.has_prepare_quorum(StateName::Prepare, Some(&proposal), &one));
        assert!(manager.has_prepare_quorum(StateName::Prepare, Some(&proposal), &two));
        assert!(!manager.has_prepare_quorum(StateName::NewRound, None, &two));

        let with_proposer = vec![
            prepare(validators[0]),
            prepare(validators[1]),
            prepare(validators[2]),
        ];
        assert!(!manager.has_prepare_quorum(StateName::Prepare, Some(&proposal), &with_proposer));
    }

    #[test]
    fn no_quorum_before_init() {
        let validators = ids(4);
        let backend = LocalBackend::new(ValidatorKeypair::from_seed(&[1; 32]), validators.clone());
        let manager = ValidatorManager::new(Arc::new(backend));

        let all: HashSet<_> = validators.iter().copied().collect();
        assert!(!manager.has_quorum(&all));
        assert_eq!(manager.quorum_size(), 0);
        assert!(manager.proposer(1, 0).is_none());

        manager.init(1).unwrap();
        assert!(manager.has_quorum(&all));
        assert!(manager.proposer(1, 0).is_some());
    }
}
