//! Quorum-triggered wake-ups.
//!
//! A worker that waits for "enough PREPAREs for view 5/0" registers a
//! [`Subscription`] instead of polling the store. Whenever an insertion makes
//! a `(type, view)` reach quorum, the engine signals the store, which pushes
//! the triggering round to every matching subscription.
//!
//! Notifications are hints, not payloads. A woken waiter always re-reads the
//! store, so a notification dropped because the queue was full loses nothing.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use super::types::{MessageType, View};
use crate::config::SUBSCRIPTION_CHANNEL_CAPACITY;

/// Unique handle of a live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a subscriber is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionDetails {
    pub message_type: MessageType,
    pub view: View,
    /// When set, any round `>= view.round` matches. Otherwise the round must
    /// match exactly.
    pub has_min_round: bool,
}

impl SubscriptionDetails {
    /// Exact-view subscription.
    pub fn exact(message_type: MessageType, view: View) -> Self {
        Self {
            message_type,
            view,
            has_min_round: false,
        }
    }

    /// Subscription to every round from `view.round` upwards.
    pub fn from_round(message_type: MessageType, view: View) -> Self {
        Self {
            message_type,
            view,
            has_min_round: true,
        }
    }

    /// Whether an event for `(message_type, view)` concerns this subscription.
    pub fn matches(&self, message_type: MessageType, view: View) -> bool {
        if self.message_type != message_type || self.view.height != view.height {
            return false;
        }
        if self.has_min_round {
            view.round >= self.view.round
        } else {
            view.round == self.view.round
        }
    }
}

/// A live registration. Each notification carries the round that triggered it.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub details: SubscriptionDetails,
    receiver: mpsc::Receiver<u64>,
}

impl Subscription {
    /// Waits for the next notification. Returns `None` once the subscription
    /// has been removed from the store.
    pub async fn recv(&mut self) -> Option<u64> {
        self.receiver.recv().await
    }
}

/// The store-side half of all subscriptions.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: HashMap<SubscriptionId, (SubscriptionDetails, mpsc::Sender<u64>)>,
}

impl SubscriptionRegistry {
    pub(crate) fn subscribe(&mut self, details: SubscriptionDetails) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let id = SubscriptionId::new();
        self.subscriptions.insert(id, (details, sender));
        Subscription {
            id,
            details,
            receiver,
        }
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.remove(&id);
    }

    pub(crate) fn signal(&self, message_type: MessageType, view: View) {
        for (id, (details, sender)) in &self.subscriptions {
            if !details.matches(message_type, view) {
                continue;
            }
            if sender.try_send(view.round).is_err() {
                trace!(subscription = %id, %view, "subscription queue full or closed, notification dropped");
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}
