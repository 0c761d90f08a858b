//! # IBFT Sequence Engine
//!
//! [`Ibft::run_sequence`] drives one height to finality. Every round races
//! four workers under one round-scoped cancellation token:
//!
//! 1. the **round timer**, which reports expiry after `timeout(round)`;
//! 2. the **future-proposal watcher**, which reports a valid PRE-PREPARE for
//!    a higher round;
//! 3. the **future-RCC watcher**, which reports a round change certificate
//!    for a higher round;
//! 4. the **round runner**, which proposes if it is its turn and then walks
//!    `NewRound -> Prepare -> Commit -> Fin`.
//!
//! ```text
//!            +---------- expired / future RCC ----------+
//!            v                                          |
//!  NewRound --> Prepare --> Commit --> Fin --> insert   |
//!     ^            ^                                    |
//!     |            +------- future proposal ------------+
//!     +-------------------------------------------------+
//! ```
//!
//! The first worker to report wins. The sequence loop then cancels the round
//! token and waits for all four workers to return before it touches the
//! state again, so exactly one round's workers are ever alive.
//!
//! ## Ingestion
//!
//! [`Ibft::add_message`] may run concurrently with a sequence (typically on
//! a transport task). It filters stale or foreign messages, stores the rest,
//! and wakes subscribers when the message completes a quorum.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use prometheus::Histogram;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use super::backend::{Backend, Transport};
use super::error::ConsensusError;
use super::state::{SequenceState, SharedSnapshot, StateName};
use super::timer::{round_timeout, run_round_timer};
use super::validation::{highest_prepared_proposal, Validator};
use super::validator_manager::ValidatorManager;
use crate::config::{ConsensusConfig, ROUND_EVENT_CHANNEL_CAPACITY};
use crate::crypto::Hash;
use crate::messages::helpers::{extract_committed_seals, senders};
use crate::messages::{
    ConsensusMessage, MessageStore, MessageType, Messages, PreparedCertificate, Proposal,
    RoundChangeCertificate, Subscription, SubscriptionDetails, View,
};
use crate::metrics::ConsensusMetrics;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The height was finalized and handed to the backend.
    Committed { round: u64, proposal_hash: Hash },
    /// The caller cancelled the sequence before finality.
    Cancelled,
}

/// What ended a round. Exactly one is acted upon per round.
#[derive(Debug)]
pub(crate) enum RoundEvent {
    /// A valid proposal for a higher round arrived.
    NewProposal {
        message: ConsensusMessage,
        round: u64,
    },
    /// A round change certificate for a higher round can be assembled.
    NewRcc { round: u64 },
    /// The round timer fired.
    Expired,
    /// The runner reached the fin state.
    Done,
}

enum RoundOutcome {
    Event(RoundEvent),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Subscription guard
// ---------------------------------------------------------------------------

/// Unsubscribes when dropped, whichever way the waiting worker exits.
struct SubscriptionGuard<'a> {
    messages: &'a dyn Messages,
    subscription: Subscription,
}

impl SubscriptionGuard<'_> {
    /// Next notified round, or `None` once the round is torn down.
    async fn wait(&mut self, token: &CancellationToken) -> Option<u64> {
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            round = self.subscription.recv() => round,
        }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.messages.unsubscribe(self.subscription.id);
    }
}

// ---------------------------------------------------------------------------
// Ibft
// ---------------------------------------------------------------------------

/// One IBFT state machine instance.
pub struct Ibft {
    backend: Arc<dyn Backend>,
    transport: Arc<dyn Transport>,
    messages: Arc<dyn Messages>,
    validators: ValidatorManager,
    snapshot: SharedSnapshot,
    config: RwLock<ConsensusConfig>,
    metrics: Option<Arc<ConsensusMetrics>>,
    span: Span,
    /// Serializes sequences: the state of one height has a single owner.
    sequence_lock: Mutex<()>,
}

impl Ibft {
    /// Creates an engine with an in-memory [`MessageStore`] and the default
    /// configuration. Every log line of the engine is emitted inside `span`.
    pub fn new(backend: Arc<dyn Backend>, transport: Arc<dyn Transport>, span: Span) -> Self {
        Self {
            validators: ValidatorManager::new(backend.clone()),
            backend,
            transport,
            messages: Arc::new(MessageStore::new()),
            snapshot: SharedSnapshot::default(),
            config: RwLock::new(ConsensusConfig::default()),
            metrics: None,
            span,
            sequence_lock: Mutex::new(()),
        }
    }

    /// Replaces the message store.
    pub fn with_messages(mut self, messages: Arc<dyn Messages>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_config(self, config: ConsensusConfig) -> Self {
        *self.config.write() = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ConsensusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds `amount` on top of every subsequent round timeout.
    pub fn extend_round_timeout(&self, amount: Duration) {
        self.config.write().additional_timeout = amount;
    }

    /// The `(height, round)` the engine is currently working on.
    pub fn current_view(&self) -> View {
        self.snapshot.read().view
    }

    /// The sub-state of the current round.
    pub fn current_state(&self) -> StateName {
        self.snapshot.read().name
    }

    pub fn messages(&self) -> &Arc<dyn Messages> {
        &self.messages
    }

    pub fn validators(&self) -> &ValidatorManager {
        &self.validators
    }

    // -----------------------------------------------------------------------
    // Sequence
    // -----------------------------------------------------------------------

    /// Drives `height` to finality or until `cancel` fires.
    ///
    /// Timeouts never surface here; they turn into round changes. The only
    /// error is a height whose validator set cannot be resolved.
    pub async fn run_sequence(
        &self,
        height: u64,
        cancel: CancellationToken,
    ) -> Result<SequenceOutcome, ConsensusError> {
        let span = info_span!(parent: &self.span, "sequence", height);
        self.sequence(height, cancel).instrument(span).await
    }

    async fn sequence(
        &self,
        height: u64,
        cancel: CancellationToken,
    ) -> Result<SequenceOutcome, ConsensusError> {
        let _owner = self.sequence_lock.lock().await;
        let started = Instant::now();

        let mut state = SequenceState::new(self.snapshot.clone());
        state.reset(height);

        if let Err(e) = self.validators.init(height) {
            error!(error = %e, "failed to run sequence: validator set unavailable");
            return Err(e);
        }
        if let (Some(metrics), Some(set)) = (&self.metrics, self.validators.validator_set()) {
            metrics.validators.set(set.len() as i64);
        }

        self.messages.prune_by_height(height);

        info!("sequence started");
        let outcome = self.run_rounds(&mut state, &cancel).await;
        self.observe(|m| &m.sequence_duration_seconds, started);
        info!(?outcome, "sequence done");

        Ok(outcome)
    }

    async fn run_rounds(
        &self,
        state: &mut SequenceState,
        cancel: &CancellationToken,
    ) -> SequenceOutcome {
        loop {
            let view = state.view();
            let current_round = view.round;
            info!(round = current_round, "round started");

            let outcome = self.run_round(state, view, cancel).await;

            let event = match outcome {
                RoundOutcome::Cancelled => {
                    debug!("sequence cancelled");
                    return SequenceOutcome::Cancelled;
                }
                RoundOutcome::Event(event) => event,
            };

            match event {
                RoundEvent::NewProposal { message, round } => {
                    info!(round, "received future proposal");
                    self.count_round_change();
                    state.move_to_new_round(round);
                    state.accept_proposal(message);
                    state.set_round_started(true);
                    self.send_prepare_message(state);
                }
                RoundEvent::NewRcc { round } => {
                    info!(round, "received future round change certificate");
                    self.count_round_change();
                    state.move_to_new_round(round);
                }
                RoundEvent::Expired => {
                    info!(round = current_round, "round timeout expired");
                    self.count_round_change();
                    let new_round = current_round + 1;
                    state.move_to_new_round(new_round);
                    self.send_round_change_message(state, view.height, new_round);
                }
                RoundEvent::Done => {
                    return match self.insert_block(state).await {
                        Some(proposal_hash) => SequenceOutcome::Committed {
                            round: state.round(),
                            proposal_hash,
                        },
                        None => SequenceOutcome::Cancelled,
                    };
                }
            }
        }
    }

    /// Runs the four workers of one round and returns whatever ended it.
    /// All workers have returned by the time this does.
    async fn run_round(
        &self,
        state: &mut SequenceState,
        view: View,
        cancel: &CancellationToken,
    ) -> RoundOutcome {
        let started = Instant::now();
        let token = cancel.child_token();
        let (events, mut outcomes) = mpsc::channel(ROUND_EVENT_CHANNEL_CAPACITY);

        let timer = run_round_timer(
            view.round,
            self.round_timeout(view.round),
            events.clone(),
            token.clone(),
        );
        let proposals = self.watch_for_future_proposal(view, events.clone(), token.clone());
        let certificates =
            self.watch_for_round_change_certificates(view, events.clone(), token.clone());
        let runner = self.start_round(state, events, token.clone());

        let workers = async {
            tokio::join!(timer, proposals, certificates, runner);
        };
        tokio::pin!(workers);

        let mut joined = false;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => RoundOutcome::Cancelled,
            event = outcomes.recv() => match event {
                Some(event) => RoundOutcome::Event(event),
                None => RoundOutcome::Cancelled,
            },
            _ = &mut workers => {
                joined = true;
                RoundOutcome::Cancelled
            }
        };

        token.cancel();
        if !joined {
            (&mut workers).await;
        }
        self.observe(|m| &m.round_duration_seconds, started);

        outcome
    }

    fn round_timeout(&self, round: u64) -> Duration {
        let config = self.config.read();
        round_timeout(config.base_round_timeout, config.additional_timeout, round)
    }

    // -----------------------------------------------------------------------
    // Watchers
    // -----------------------------------------------------------------------

    /// Reports the first valid PRE-PREPARE for any round above `view.round`.
    async fn watch_for_future_proposal(
        &self,
        view: View,
        events: mpsc::Sender<RoundEvent>,
        token: CancellationToken,
    ) {
        let height = view.height;
        let mut sub = self.subscribe(SubscriptionDetails::from_round(
            MessageType::PrePrepare,
            View::new(height, view.round + 1),
        ));

        while let Some(round) = sub.wait(&token).await {
            let Some(message) = self.handle_preprepare(View::new(height, round)) else {
                continue;
            };
            let _ = events.send(RoundEvent::NewProposal { message, round }).await;
            return;
        }
    }

    /// Reports the first round change certificate for a round above
    /// `view.round`.
    async fn watch_for_round_change_certificates(
        &self,
        view: View,
        events: mpsc::Sender<RoundEvent>,
        token: CancellationToken,
    ) {
        let mut sub = self.subscribe(SubscriptionDetails::from_round(
            MessageType::RoundChange,
            View::new(view.height, view.round + 1),
        ));

        while sub.wait(&token).await.is_some() {
            let Some(rcc) = self.handle_round_change_message(view, false, |r| r > view.round)
            else {
                continue;
            };
            let Some(round) = rcc.round_change_messages.first().map(|m| m.view.round) else {
                continue;
            };
            let _ = events.send(RoundEvent::NewRcc { round }).await;
            return;
        }
    }

    // -----------------------------------------------------------------------
    // Round runner
    // -----------------------------------------------------------------------

    async fn start_round(
        &self,
        state: &mut SequenceState,
        events: mpsc::Sender<RoundEvent>,
        token: CancellationToken,
    ) {
        state.new_round();
        let view = state.view();

        if self.backend.is_proposer(&self.backend.id(), view.height, view.round) {
            info!(round = view.round, "we are the proposer");

            let Some(proposal_message) = self.build_proposal(state, view, &token).await else {
                if !token.is_cancelled() {
                    error!(round = view.round, "unable to build proposal");
                }
                return;
            };

            state.accept_proposal(proposal_message.clone());
            debug!("block proposal accepted");

            self.send_preprepare_message(proposal_message);
            debug!("pre-prepare message multicasted");
        }

        self.run_states(state, events, token).await;
    }

    async fn run_states(
        &self,
        state: &mut SequenceState,
        events: mpsc::Sender<RoundEvent>,
        token: CancellationToken,
    ) {
        loop {
            let flow = match state.name() {
                StateName::NewRound => self.run_new_round(state, &token).await,
                StateName::Prepare => self.run_prepare(state, &token).await,
                StateName::Commit => self.run_commit(state, &token).await,
                StateName::Fin => {
                    debug!("enter: fin state");
                    let _ = events.send(RoundEvent::Done).await;
                    return;
                }
            };
            if flow.is_break() {
                return;
            }
        }
    }

    async fn run_new_round(
        &self,
        state: &mut SequenceState,
        token: &CancellationToken,
    ) -> ControlFlow<()> {
        let started = Instant::now();
        debug!("enter: new round state");

        let view = state.view();
        let mut sub = self.subscribe(SubscriptionDetails::exact(MessageType::PrePrepare, view));

        let flow = loop {
            if sub.wait(token).await.is_none() {
                break ControlFlow::Break(());
            }
            let Some(proposal_message) = self.handle_preprepare(view) else {
                continue;
            };

            state.accept_proposal(proposal_message);
            self.send_prepare_message(state);
            debug!("prepare message multicasted");
            break ControlFlow::Continue(());
        };

        self.observe(|m| &m.new_round_duration_seconds, started);
        debug!("exit: new round state");
        flow
    }

    async fn run_prepare(
        &self,
        state: &mut SequenceState,
        token: &CancellationToken,
    ) -> ControlFlow<()> {
        let started = Instant::now();
        debug!("enter: prepare state");

        let view = state.view();
        let mut sub = self.subscribe(SubscriptionDetails::exact(MessageType::Prepare, view));

        let flow = loop {
            if sub.wait(token).await.is_none() {
                break ControlFlow::Break(());
            }
            if self.handle_prepare(state, view) {
                break ControlFlow::Continue(());
            }
        };

        self.observe(|m| &m.prepare_duration_seconds, started);
        debug!("exit: prepare state");
        flow
    }

    async fn run_commit(
        &self,
        state: &mut SequenceState,
        token: &CancellationToken,
    ) -> ControlFlow<()> {
        let started = Instant::now();
        debug!("enter: commit state");

        let view = state.view();
        let mut sub = self.subscribe(SubscriptionDetails::exact(MessageType::Commit, view));

        let flow = loop {
            if sub.wait(token).await.is_none() {
                break ControlFlow::Break(());
            }
            if self.handle_commit(state, view) {
                break ControlFlow::Continue(());
            }
        };

        self.observe(|m| &m.commit_duration_seconds, started);
        debug!("exit: commit state");
        flow
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn validator(&self) -> Validator<'_> {
        Validator::new(self.backend.as_ref(), &self.validators)
    }

    /// The first valid PRE-PREPARE stored for `view`.
    fn handle_preprepare(&self, view: View) -> Option<ConsensusMessage> {
        let validator = self.validator();
        self.messages
            .get_valid_messages(view, MessageType::PrePrepare, &|msg: &ConsensusMessage| {
                validator.is_valid_preprepare(msg, view)
            })
            .into_iter()
            .next()
    }

    /// Moves to the commit state once a prepare quorum for the accepted
    /// proposal is stored.
    fn handle_prepare(&self, state: &mut SequenceState, view: View) -> bool {
        let (Some(proposal_message), Some(proposal)) =
            (state.proposal_message().cloned(), state.proposal().cloned())
        else {
            return false;
        };

        let prepare_messages = self.messages.get_valid_messages(
            view,
            MessageType::Prepare,
            &|msg: &ConsensusMessage| {
                msg.prepare_hash()
                    .is_some_and(|hash| self.backend.is_valid_proposal_hash(&proposal, hash))
            },
        );

        if !self.validators.has_prepare_quorum(
            state.name(),
            Some(&proposal_message),
            &prepare_messages,
        ) {
            return false;
        }

        self.send_commit_message(state);
        debug!("commit message multicasted");

        state.finalize_prepare(
            PreparedCertificate {
                proposal_message: Box::new(proposal_message),
                prepare_messages,
            },
            proposal,
        );
        true
    }

    /// Moves to the fin state once a commit quorum with valid seals is stored.
    fn handle_commit(&self, state: &mut SequenceState, view: View) -> bool {
        let Some(proposal) = state.proposal().cloned() else {
            return false;
        };

        let commit_messages = self.messages.get_valid_messages(
            view,
            MessageType::Commit,
            &|msg: &ConsensusMessage| match (msg.commit_hash(), msg.committed_seal()) {
                (Some(hash), Some(seal)) => {
                    seal.signer == msg.from
                        && self.backend.is_valid_proposal_hash(&proposal, hash)
                        && self.backend.is_valid_committed_seal(hash, seal)
                }
                _ => false,
            },
        );

        if !self.validators.has_quorum(&senders(&commit_messages)) {
            return false;
        }

        match extract_committed_seals(&commit_messages) {
            Ok(seals) => {
                state.set_committed_seals(seals);
                state.change_state(StateName::Fin);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to extract committed seals from commit messages");
                false
            }
        }
    }

    /// Assembles a round change certificate at `view.height` for the
    /// highest round accepted by `round_filter`.
    fn handle_round_change_message(
        &self,
        view: View,
        has_accepted_proposal: bool,
        round_filter: impl Fn(u64) -> bool,
    ) -> Option<RoundChangeCertificate> {
        let height = view.height;
        let validator = self.validator();

        let is_valid_message =
            |msg: &ConsensusMessage| validator.is_valid_round_change(msg, height);
        let is_valid_rcc = |round: u64, msgs: &[ConsensusMessage]| {
            if !round_filter(round) {
                return false;
            }
            // A round change for our own round only counts while we have
            // not accepted a proposal in it.
            if round == view.round && has_accepted_proposal {
                return false;
            }
            self.has_quorum_by_msg_type(msgs, MessageType::RoundChange)
        };

        self.messages
            .get_extended_rcc(height, &is_valid_message, &is_valid_rcc)
            .map(|round_change_messages| RoundChangeCertificate {
                round_change_messages,
            })
    }

    // -----------------------------------------------------------------------
    // Proposing
    // -----------------------------------------------------------------------

    async fn build_proposal(
        &self,
        state: &SequenceState,
        view: View,
        token: &CancellationToken,
    ) -> Option<ConsensusMessage> {
        if view.round == 0 {
            let raw_proposal = self.build_raw_proposal(view).await?;
            return self
                .backend
                .build_preprepare_message(raw_proposal, None, view);
        }

        // Above round 0 a quorum must have asked for this round first.
        let Some(rcc) = self.wait_for_rcc(state, view, token).await else {
            if !token.is_cancelled() {
                error!(round = view.round, "no valid round change certificate received");
            }
            return None;
        };

        let raw_proposal = match highest_prepared_proposal(&rcc.round_change_messages) {
            Some(previous) => {
                debug!(round = view.round, "re-proposing previously prepared proposal");
                previous
            }
            None => self.build_raw_proposal(view).await?,
        };

        self.backend
            .build_preprepare_message(raw_proposal, Some(rcc), view)
    }

    async fn build_raw_proposal(&self, view: View) -> Option<Vec<u8>> {
        let started = Instant::now();
        let raw_proposal = self.backend.build_proposal(view).await;
        self.observe(|m| &m.build_proposal_duration_seconds, started);
        raw_proposal
    }

    /// Waits for a round change certificate for exactly `view.round`.
    async fn wait_for_rcc(
        &self,
        state: &SequenceState,
        view: View,
        token: &CancellationToken,
    ) -> Option<RoundChangeCertificate> {
        let mut sub = self.subscribe(SubscriptionDetails::exact(MessageType::RoundChange, view));
        let has_accepted_proposal = state.proposal_message().is_some();

        loop {
            sub.wait(token).await?;
            if let Some(rcc) =
                self.handle_round_change_message(view, has_accepted_proposal, |r| r == view.round)
            {
                return Some(rcc);
            }
        }
    }

    async fn insert_block(&self, state: &SequenceState) -> Option<Hash> {
        let (Some(proposal), Some(proposal_hash)) = (state.proposal(), state.proposal_hash())
        else {
            error!("round finished without an accepted proposal");
            return None;
        };

        let started = Instant::now();
        self.backend
            .insert_proposal(
                Proposal {
                    raw_proposal: proposal.raw_proposal.clone(),
                    round: state.round(),
                },
                state.committed_seals().to_vec(),
            )
            .await;
        self.observe(|m| &m.insert_proposal_duration_seconds, started);
        if let Some(metrics) = &self.metrics {
            metrics.sequences_committed_total.inc();
        }

        // Everything at or below the finished height is now useless.
        self.messages.prune_by_height(state.height() + 1);
        Some(proposal_hash)
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Offers an inbound message to the engine.
    ///
    /// Unacceptable messages are dropped silently. Accepted messages are
    /// stored, and subscribers are woken if the message's `(type, view)` now
    /// has quorum at the current height.
    pub fn add_message(&self, message: ConsensusMessage) {
        let _entered = self.span.enter();

        if !self.is_acceptable_message(&message) {
            trace!(view = %message.view, sender = %message.from, "dropping unacceptable message");
            return;
        }

        let view = message.view;
        let message_type = message.message_type();
        self.messages.add_message(message);
        if let Some(metrics) = &self.metrics {
            metrics.message_received(message_type);
        }

        // Subscriptions only ever concern the current height.
        let current_height = self.snapshot.read().view.height;
        if view.height != current_height {
            return;
        }

        let stored = self
            .messages
            .get_valid_messages(view, message_type, &|_: &ConsensusMessage| true);
        if self.has_quorum_by_msg_type(&stored, message_type) {
            self.messages.signal_event(message_type, view);
        }
    }

    /// Whether a message may enter the store at all.
    ///
    /// Messages for past heights, from non-validators, or for rounds below
    /// the current one at the current height are rejected.
    pub fn is_acceptable_message(&self, message: &ConsensusMessage) -> bool {
        let current = self.snapshot.read().view;

        if current.height > message.view.height {
            return false;
        }
        if !self.backend.is_valid_validator(message) {
            return false;
        }
        if current.height == message.view.height {
            return message.view.round >= current.round;
        }
        true
    }

    /// Quorum rule per message type.
    fn has_quorum_by_msg_type(&self, messages: &[ConsensusMessage], message_type: MessageType) -> bool {
        match message_type {
            MessageType::PrePrepare => !messages.is_empty(),
            MessageType::Prepare => {
                let snapshot = self.snapshot.read();
                self.validators.has_prepare_quorum(
                    snapshot.name,
                    snapshot.proposal_message.as_ref(),
                    messages,
                )
            }
            MessageType::Commit | MessageType::RoundChange => {
                self.validators.has_quorum(&senders(messages))
            }
        }
    }

    /// Subscribes, then wakes the new subscription at once if its condition
    /// already holds, so a quorum completed before subscribing is not lost.
    fn subscribe(&self, details: SubscriptionDetails) -> SubscriptionGuard<'_> {
        let subscription = self.messages.subscribe(details);

        let ready = if details.has_min_round && details.message_type == MessageType::RoundChange {
            let most = self
                .messages
                .get_most_round_change_messages(details.view.round, details.view.height);
            most.first()
                .map(|msg| msg.view)
                .filter(|_| self.has_quorum_by_msg_type(&most, MessageType::RoundChange))
        } else {
            let stored = self.messages.get_valid_messages(
                details.view,
                details.message_type,
                &|_: &ConsensusMessage| true,
            );
            self.has_quorum_by_msg_type(&stored, details.message_type)
                .then_some(details.view)
        };

        if let Some(view) = ready {
            self.messages.signal_event(details.message_type, view);
        }

        SubscriptionGuard {
            messages: self.messages.as_ref(),
            subscription,
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    fn multicast(&self, message: Option<ConsensusMessage>, message_type: MessageType) {
        let Some(message) = message else {
            warn!(%message_type, "backend could not build message");
            return;
        };
        match self.transport.multicast(message) {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.message_sent(message_type);
                }
            }
            Err(e) => warn!(%message_type, error = %e, "multicast failed"),
        }
    }

    fn send_preprepare_message(&self, message: ConsensusMessage) {
        self.multicast(Some(message), MessageType::PrePrepare);
    }

    fn send_prepare_message(&self, state: &SequenceState) {
        let message = state
            .proposal_hash()
            .and_then(|hash| self.backend.build_prepare_message(hash, state.view()));
        self.multicast(message, MessageType::Prepare);
    }

    fn send_commit_message(&self, state: &SequenceState) {
        let message = state
            .proposal_hash()
            .and_then(|hash| self.backend.build_commit_message(hash, state.view()));
        self.multicast(message, MessageType::Commit);
    }

    fn send_round_change_message(&self, state: &SequenceState, height: u64, new_round: u64) {
        let message = self.backend.build_round_change_message(
            state.latest_prepared_proposal().cloned(),
            state.latest_pc().cloned(),
            View::new(height, new_round),
        );
        self.multicast(message, MessageType::RoundChange);
    }

    // -----------------------------------------------------------------------
    // Metrics
    // -----------------------------------------------------------------------

    fn observe(&self, histogram: impl FnOnce(&ConsensusMetrics) -> &Histogram, started: Instant) {
        if let Some(metrics) = &self.metrics {
            histogram(metrics.as_ref()).observe(started.elapsed().as_secs_f64());
        }
    }

    fn count_round_change(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.round_changes_total.inc();
        }
    }
}
