//! Component C: the admission controller.
//!
//! Combines the limiter's token bucket with the queue-depth and buffer-pressure
//! pre-emptive checks (§4.3), in the same "gate, then delegate" shape
//! `mcpkit-transport::pool::manager::Pool::acquire` uses for its own capacity/timeout
//! checks before reaching for a connection.

use tokio::time::Instant;

use crate::limiter::{Limiter, AVG_TIME_THRESHOLD_MS};
use crate::transport::TransportView;

/// Tunables the admission controller consults on every decision (§6 configuration
/// table, the subset relevant to §4.3's three gates).
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    /// Per-endpoint pending-queue cutoff (default 3000).
    pub max_pending: usize,
    /// Per-socket average buffer cutoff in bytes (default 50).
    pub max_buffer: u64,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_pending: 3000,
            max_buffer: 50,
        }
    }
}

/// Outcome of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Admit,
    /// The request must be rejected with a synthetic 429 (§4.3 "Side effects on
    /// rejection").
    Reject,
}

/// Evaluate the three-rule decision order (§4.3) for one admission check against
/// `name`, using `limiter`'s token bucket and `view`'s socket/queue counts.
///
/// `with_failed` controls whether a rejection bumps the limiter's `failed` feedback
/// tally (true for the pre-check path, false for the on-submit path, matching source
/// behavior — see `DESIGN.md` for the resolution of §9 open question 2).
pub async fn decide(
    limiter: &Limiter,
    view: &dyn TransportView,
    name: &str,
    limits: AdmissionLimits,
    with_failed: bool,
) -> Decision {
    let now = Instant::now();

    // Rule 1: queue-depth gate.
    if view.pending_len(name) >= limits.max_pending {
        reject_bookkeeping(limiter, now, with_failed).await;
        return Decision::Reject;
    }

    // Rule 2: buffer-pressure gate. Only evaluated once the limiter has admitted at
    // least one token this interval (§9 open question 3: the first request of a cold
    // interval is exempt) and the endpoint actually has open sockets to sample.
    if limiter.has_admitted_this_interval().await {
        let open = view.open_sockets_len(name);
        if open > 0 {
            let avg_buffer = view.avg_buffer_size(name);
            let average_time_ms = limiter.average_time_ms().await;
            let cap = if average_time_ms < AVG_TIME_THRESHOLD_MS {
                limits.max_buffer * 7
            } else {
                limits.max_buffer
            };
            if avg_buffer > cap {
                reject_bookkeeping(limiter, now, with_failed).await;
                return Decision::Reject;
            }
        }
    }

    // Rule 3: token bucket.
    if limiter.accept_at(now, 1).await {
        Decision::Admit
    } else {
        if with_failed {
            limiter.bump_failed().await;
        }
        Decision::Reject
    }
}

async fn reject_bookkeeping(limiter: &Limiter, now: Instant, with_failed: bool) {
    limiter.bump_incoming(now, 1).await;
    if with_failed {
        limiter.bump_failed().await;
    }
}
