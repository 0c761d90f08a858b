//! # IBFT Consensus
//!
//! A round-based Byzantine fault tolerant state machine. With `n` validators
//! it tolerates `f` faulty ones as long as `n >= 3f + 1`, and finalizes one
//! block per height with a quorum of committed seals.
//!
//! - **engine** drives a height through rounds and ingests messages.
//! - **state** is the per-height state the engine mutates.
//! - **validation** holds the proposal, certificate, and round change rules.
//! - **validator_manager** resolves voting powers and answers quorum checks.
//! - **timer** computes round timeouts and runs the round timer.
//! - **backend** is the seam to the host: block building, signatures,
//!   validator membership, and message transport.

pub mod backend;
pub mod engine;
pub mod error;
pub mod state;
pub mod timer;
pub mod validation;
pub mod validator_manager;

pub use backend::{Backend, Transport};
pub use engine::{Ibft, SequenceOutcome};
pub use error::{BoxError, ConsensusError, TransportError};
pub use state::{SequenceState, StateName, StateSnapshot};
pub use timer::round_timeout;
pub use validation::{highest_prepared_proposal, Validator};
pub use validator_manager::{calculate_quorum, ValidatorManager, ValidatorSet};
