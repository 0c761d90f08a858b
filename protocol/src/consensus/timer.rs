//! Round timeouts.
//!
//! `timeout(r) = base * 2^r + additional`. The exponent saturates at
//! [`MAX_ROUND_EXPONENT`] and the result saturates at `Duration::MAX`, so
//! arbitrarily high rounds never overflow.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::RoundEvent;
use crate::config::{MAX_ROUND_EXPONENT, ROUND_FACTOR_BASE};

/// How long `round` may last before the node asks for a round change.
pub fn round_timeout(base: Duration, additional: Duration, round: u64) -> Duration {
    // MAX_ROUND_EXPONENT fits comfortably in a u32.
    let exponent = round.min(MAX_ROUND_EXPONENT) as u32;
    let factor = u128::from(ROUND_FACTOR_BASE).pow(exponent);
    let nanos = base.as_nanos().saturating_mul(factor);

    let scaled = match u64::try_from(nanos) {
        Ok(nanos) => Duration::from_nanos(nanos),
        Err(_) => Duration::MAX,
    };
    scaled.saturating_add(additional)
}

/// Round timer worker: reports [`RoundEvent::Expired`] once `timeout` has
/// elapsed, unless the round is torn down first.
pub(crate) async fn run_round_timer(
    round: u64,
    timeout: Duration,
    events: mpsc::Sender<RoundEvent>,
    token: CancellationToken,
) {
    // A saturated timeout never fires; only teardown ends the worker.
    let Some(deadline) = Instant::now().checked_add(timeout) else {
        token.cancelled().await;
        return;
    };
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep_until(deadline) => {
            debug!(round, timeout_ms = timeout.as_millis() as u64, "round timer fired");
            // The receiver is gone only if the round already ended.
            let _ = events.send(RoundEvent::Expired).await;
        }
    }
}
