//! In-memory message store.
//!
//! Messages are indexed `type -> height -> round -> sender`. Keying the
//! innermost level by sender means a validator can hold at most one message
//! per `(view, type)`: a duplicate replaces the earlier copy and never counts
//! twice toward a quorum.
//!
//! ## Locking
//!
//! One `RwLock` guards the index. Writers (insertion, pruning) take it
//! exclusively; readers clone the slice they need under the shared lock and
//! run their (possibly expensive, signature-checking) predicates after
//! releasing it. Subscriptions live behind a separate `Mutex` so signalling
//! never waits on a reader.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::subscription::{Subscription, SubscriptionDetails, SubscriptionId, SubscriptionRegistry};
use super::types::{ConsensusMessage, MessageType, View};
use super::Messages;
use crate::crypto::ValidatorId;

type RoundMessages = BTreeMap<ValidatorId, ConsensusMessage>;
type HeightMessages = BTreeMap<u64, RoundMessages>;
type TypeMessages = BTreeMap<u64, HeightMessages>;

/// The default [`Messages`] implementation.
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: RwLock<HashMap<MessageType, TypeMessages>>,
    subscriptions: Mutex<SubscriptionRegistry>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages of one type for one view.
    pub fn count(&self, view: View, message_type: MessageType) -> usize {
        self.messages
            .read()
            .get(&message_type)
            .and_then(|heights| heights.get(&view.height))
            .and_then(|rounds| rounds.get(&view.round))
            .map_or(0, BTreeMap::len)
    }

    /// Number of stored messages across all types and views.
    pub fn len(&self) -> usize {
        self.messages
            .read()
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Snapshot of every round of one type at one height.
    fn height_snapshot(&self, message_type: MessageType, height: u64) -> HeightMessages {
        self.messages
            .read()
            .get(&message_type)
            .and_then(|heights| heights.get(&height))
            .cloned()
            .unwrap_or_default()
    }
}

impl Messages for MessageStore {
    fn add_message(&self, message: ConsensusMessage) {
        let message_type = message.message_type();
        let view = message.view;
        let mut messages = self.messages.write();
        let previous = messages
            .entry(message_type)
            .or_default()
            .entry(view.height)
            .or_default()
            .entry(view.round)
            .or_default()
            .insert(message.from, message);
        if previous.is_some() {
            trace!(%view, %message_type, "replaced message from the same sender");
        }
    }

    fn prune_by_height(&self, height: u64) {
        let mut messages = self.messages.write();
        for heights in messages.values_mut() {
            *heights = heights.split_off(&height);
        }
    }

    fn signal_event(&self, message_type: MessageType, view: View) {
        self.subscriptions.lock().signal(message_type, view);
    }

    fn get_valid_messages(
        &self,
        view: View,
        message_type: MessageType,
        is_valid: &dyn Fn(&ConsensusMessage) -> bool,
    ) -> Vec<ConsensusMessage> {
        let candidates: Vec<ConsensusMessage> = self
            .messages
            .read()
            .get(&message_type)
            .and_then(|heights| heights.get(&view.height))
            .and_then(|rounds| rounds.get(&view.round))
            .map(|senders| senders.values().cloned().collect())
            .unwrap_or_default();

        candidates.into_iter().filter(|msg| is_valid(msg)).collect()
    }

    fn get_extended_rcc(
        &self,
        height: u64,
        is_valid_message: &dyn Fn(&ConsensusMessage) -> bool,
        is_valid_rcc: &dyn Fn(u64, &[ConsensusMessage]) -> bool,
    ) -> Option<Vec<ConsensusMessage>> {
        let rounds = self.height_snapshot(MessageType::RoundChange, height);

        let mut best: Option<(u64, Vec<ConsensusMessage>)> = None;
        for (round, senders) in rounds {
            // Round 0 never needs a certificate, and lower rounds than the
            // best one so far cannot win.
            let best_round = best.as_ref().map_or(0, |(r, _)| *r);
            if round <= best_round {
                continue;
            }

            let valid: Vec<ConsensusMessage> = senders
                .into_values()
                .filter(|msg| is_valid_message(msg))
                .collect();
            if !is_valid_rcc(round, &valid) {
                continue;
            }
            best = Some((round, valid));
        }

        best.map(|(_, messages)| messages)
    }

    fn get_most_round_change_messages(&self, min_round: u64, height: u64) -> Vec<ConsensusMessage> {
        let rounds = self.height_snapshot(MessageType::RoundChange, height);

        let mut best: Option<RoundMessages> = None;
        for (_, senders) in rounds.range(min_round..) {
            // Strictly greater: ties keep the lowest round.
            if senders.len() > best.as_ref().map_or(0, BTreeMap::len) {
                best = Some(senders.clone());
            }
        }

        best.map(|senders| senders.into_values().collect())
            .unwrap_or_default()
    }

    fn subscribe(&self, details: SubscriptionDetails) -> Subscription {
        self.subscriptions.lock().subscribe(details)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().unsubscribe(id);
    }
}
