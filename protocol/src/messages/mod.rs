//! # Consensus Messages
//!
//! Message types, the in-memory [`MessageStore`], quorum-triggered
//! subscriptions, and a few helpers over message collections.
//!
//! The engine only talks to the store through the [`Messages`] trait, so a
//! test harness can inject its own implementation.

pub mod helpers;
pub mod store;
pub mod subscription;
pub mod types;

pub use helpers::{are_valid_pc_messages, extract_committed_seals, has_unique_senders, NotACommit};
pub use store::MessageStore;
pub use subscription::{Subscription, SubscriptionDetails, SubscriptionId};
pub use types::{
    CommitData, CommittedSeal, ConsensusMessage, MessageType, Payload, PrePrepareData,
    PrepareData, PreparedCertificate, Proposal, RoundChangeCertificate, RoundChangeData, View,
};

/// Storage and wake-up contract the consensus engine relies on.
///
/// Implementations must be safe to call from the ingestion path and from
/// the round workers at the same time. A message stored by `add_message`
/// must be visible to every read that starts after a `signal_event` for it
/// has been observed.
pub trait Messages: Send + Sync {
    /// Stores a message. A second message from the same sender for the same
    /// `(view, type)` replaces the first.
    fn add_message(&self, message: ConsensusMessage);

    /// Drops every message with a height below `height`.
    fn prune_by_height(&self, height: u64);

    /// Wakes every subscription interested in `(message_type, view)`.
    fn signal_event(&self, message_type: MessageType, view: View);

    /// All stored messages of `message_type` at `view` accepted by `is_valid`.
    fn get_valid_messages(
        &self,
        view: View,
        message_type: MessageType,
        is_valid: &dyn Fn(&ConsensusMessage) -> bool,
    ) -> Vec<ConsensusMessage>;

    /// The valid ROUND-CHANGE messages of the highest round at `height` that
    /// form a certificate according to `is_valid_rcc`.
    fn get_extended_rcc(
        &self,
        height: u64,
        is_valid_message: &dyn Fn(&ConsensusMessage) -> bool,
        is_valid_rcc: &dyn Fn(u64, &[ConsensusMessage]) -> bool,
    ) -> Option<Vec<ConsensusMessage>>;

    /// The ROUND-CHANGE messages of the most populous round `>= min_round`
    /// at `height`. Ties go to the lowest round.
    fn get_most_round_change_messages(&self, min_round: u64, height: u64) -> Vec<ConsensusMessage>;

    fn subscribe(&self, details: SubscriptionDetails) -> Subscription;

    fn unsubscribe(&self, id: SubscriptionId);
}
