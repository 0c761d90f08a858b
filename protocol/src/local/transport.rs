//! In-process message hub.
//!
//! Every registered validator gets an unbounded inbox. A multicast is copied
//! into every inbox, including the sender's own, which is how a node sees its
//! own votes. An optional delivery filter drops selected copies to simulate
//! partitions and lossy links.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::consensus::{Ibft, Transport, TransportError};
use crate::crypto::ValidatorId;
use crate::messages::ConsensusMessage;

/// Decides whether the copy of a message addressed to a validator is
/// delivered. Returning `false` drops it.
pub type DeliveryFilter = Arc<dyn Fn(&ValidatorId, &ConsensusMessage) -> bool + Send + Sync>;

pub type Inbox = mpsc::UnboundedReceiver<ConsensusMessage>;

#[derive(Default)]
pub struct LocalNetwork {
    inboxes: RwLock<BTreeMap<ValidatorId, mpsc::UnboundedSender<ConsensusMessage>>>,
    filter: RwLock<Option<DeliveryFilter>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates the inbox of `id`. Registering again replaces the old inbox.
    pub fn register(&self, id: ValidatorId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(id, tx);
        rx
    }

    /// Stops delivering to `id`.
    pub fn disconnect(&self, id: &ValidatorId) {
        if self.inboxes.write().remove(id).is_some() {
            debug!(validator = %id, "validator disconnected from local network");
        }
    }

    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&ValidatorId, &ConsensusMessage) -> bool + Send + Sync + 'static,
    {
        *self.filter.write() = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.write() = None;
    }

    pub fn peer_count(&self) -> usize {
        self.inboxes.read().len()
    }

    /// A transport that multicasts into this network.
    pub fn transport(self: &Arc<Self>) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
        }
    }

    fn broadcast(&self, message: ConsensusMessage) -> Result<(), TransportError> {
        let inboxes: Vec<_> = self
            .inboxes
            .read()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();
        if inboxes.is_empty() {
            return Err(TransportError::Closed);
        }
        let filter = self.filter.read().clone();

        for (to, inbox) in inboxes {
            if filter.as_ref().is_some_and(|allow| !allow(&to, &message)) {
                trace!(to = %to, view = %message.view, "message dropped by filter");
                continue;
            }
            // A closed inbox belongs to a node that has shut down.
            if inbox.send(message.clone()).is_err() {
                trace!(to = %to, "inbox closed");
            }
        }
        Ok(())
    }
}

/// [`Transport`] handle onto a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn multicast(&self, message: ConsensusMessage) -> Result<(), TransportError> {
        self.network.broadcast(message)
    }
}

/// Feeds an inbox into an engine until the network drops the inbox.
pub fn spawn_ingest(mut inbox: Inbox, engine: Arc<Ibft>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            engine.add_message(message);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ValidatorKeypair;
    use crate::messages::{Payload, PrepareData, View};

    fn prepare(from: ValidatorId) -> ConsensusMessage {
        ConsensusMessage::unsigned(
            View::new(1, 0),
            from,
            Payload::Prepare(PrepareData {
                proposal_hash: [1; 32],
            }),
        )
    }

    fn ids() -> (ValidatorId, ValidatorId) {
        (
            ValidatorKeypair::from_seed(&[1; 32]).id(),
            ValidatorKeypair::from_seed(&[2; 32]).id(),
        )
    }

    #[test]
    fn multicast_reaches_everyone_including_sender() {
        let (a, b) = ids();
        let network = LocalNetwork::new();
        let mut inbox_a = network.register(a);
        let mut inbox_b = network.register(b);

        network.transport().multicast(prepare(a)).unwrap();

        assert_eq!(inbox_a.try_recv().unwrap().from, a);
        assert_eq!(inbox_b.try_recv().unwrap().from, a);
    }

    #[test]
    fn filter_drops_selected_copies() {
        let (a, b) = ids();
        let network = LocalNetwork::new();
        let mut inbox_a = network.register(a);
        let mut inbox_b = network.register(b);
        network.set_filter(move |to, _| *to != b);

        network.transport().multicast(prepare(a)).unwrap();
        assert!(inbox_a.try_recv().is_ok());
        assert!(inbox_b.try_recv().is_err());

        network.clear_filter();
        network.transport().multicast(prepare(a)).unwrap();
        assert!(inbox_b.try_recv().is_ok());
    }

    #[test]
    fn disconnected_validator_receives_nothing() {
        let (a, b) = ids();
        let network = LocalNetwork::new();
        let _inbox_a = network.register(a);
        let mut inbox_b = network.register(b);
        network.disconnect(&b);

        network.transport().multicast(prepare(a)).unwrap();
        assert!(inbox_b.try_recv().is_err());
        assert_eq!(network.peer_count(), 1);
    }

    #[test]
    fn empty_network_reports_closed() {
        let (a, _) = ids();
        let network = LocalNetwork::new();
        assert!(matches!(
            network.transport().multicast(prepare(a)),
            Err(TransportError::Closed)
        ));
    }
}
