use thiserror::Error;

/// Boxed error returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that abort a sequence.
///
/// Timeouts, invalid messages, and collaborator hiccups never show up here:
/// they are handled inside the round loop. Only a height that cannot even
/// start is reported to the caller.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("failed to resolve voting powers for height {height}")]
    VotingPowers {
        height: u64,
        #[source]
        source: BoxError,
    },

    #[error("validator set for height {height} is empty or has zero voting power")]
    EmptyValidatorSet { height: u64 },
}

/// Failure of a best-effort multicast.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Delivery(String),
}
