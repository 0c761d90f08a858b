//! # Consensus Configuration & Constants
//!
//! Every timing constant the engine relies on lives here. Round timeouts are
//! part of the liveness argument: all honest validators must agree on how
//! long a round lasts, otherwise they drift apart and never share a round
//! long enough to finish it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Timing Constants
// ---------------------------------------------------------------------------

/// Timeout of round 0. Every later round doubles it.
pub const ROUND0_TIMEOUT: Duration = Duration::from_secs(10);

/// Growth factor of the round timeout: `timeout(r) = base * ROUND_FACTOR_BASE^r`.
pub const ROUND_FACTOR_BASE: u32 = 2;

/// Rounds beyond this exponent saturate instead of overflowing. 2^32 times
/// the base timeout is already longer than any chain will ever wait.
pub const MAX_ROUND_EXPONENT: u64 = 32;

// ---------------------------------------------------------------------------
// Message Store
// ---------------------------------------------------------------------------

/// Capacity of each subscription's notification queue. Notifications that
/// do not fit are dropped; the waiter re-reads the store on its next wake-up.
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the per-round outcome channel. One slot per round worker.
pub const ROUND_EVENT_CHANNEL_CAPACITY: usize = 4;

// ---------------------------------------------------------------------------
// Engine Configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of the consensus engine.
///
/// These values must be identical on every validator of a shard. Changing
/// them on a subset of nodes does not break safety, but it does make round
/// changes unpredictable until everyone is on the same numbers again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Timeout of round 0; doubles every round.
    #[serde(with = "duration_ms")]
    pub base_round_timeout: Duration,
    /// Flat extension added on top of every round's exponential timeout.
    #[serde(with = "duration_ms")]
    pub additional_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            base_round_timeout: ROUND0_TIMEOUT,
            additional_timeout: Duration::ZERO,
        }
    }
}

/// Serializes durations as whole milliseconds, which is how operators
/// write them in config files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
