//! Component D: the feedback engine.
//!
//! `RateDirection` mirrors `mcpkit-transport`'s `RetryPolicy` trait
//! (`middleware/retry.rs`): an object-safe, cloneable policy trait with one pluggable
//! default implementation, installed as a `Box<dyn ...>` field on the owning config
//! (here [`crate::config::AgentConfig`]) rather than a generic type parameter, because
//! callers are expected to swap it at construction time, not per call site.

use crate::transport::TransportView;

/// The `+1` / `-1` / `0` classification a rate-direction function returns for one
/// completed request (§4.4 step 1).
pub type Direction = i8;

/// `code` argument to [`RateDirection::classify`] (§4.4: "either an HTTP numeric status
/// code, a string error code ... or undefined (abort)").
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The request completed with this HTTP status code.
    Status(u16),
    /// The request failed with this transport-level error code (e.g. `"ETIMEDOUT"`).
    ErrorCode(String),
    /// The request was aborted before it produced either of the above.
    Aborted,
}

/// Everything the default rate-direction function (and any custom one) needs besides
/// the outcome itself (§4.4: "Inputs: `code`, the agent ... the limiter").
pub struct FeedbackContext<'a> {
    /// The endpoint key feedback is being classified for.
    pub name: &'a str,
    /// Transport-side socket/queue views.
    pub view: &'a dyn TransportView,
    /// The limiter's current average latency, in milliseconds.
    pub average_time_ms: f64,
}

/// Pluggable outcome classifier (§4.4, §6 `getRateDirection`).
pub trait RateDirection: Send + Sync {
    /// Classify one completed request's outcome into `+1` (raise pressure toward
    /// increasing the rate), `-1` (lower it), or `0` (no change).
    fn classify(&self, outcome: &Outcome, ctx: &FeedbackContext<'_>) -> Direction;

    /// Clone this policy (object-safe clone, mirroring `RetryPolicy::clone_box`).
    fn clone_box(&self) -> Box<dyn RateDirection>;
}

/// The default rate-direction function (§4.4 "Default rate-direction function").
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRateDirection;

impl RateDirection for DefaultRateDirection {
    fn classify(&self, outcome: &Outcome, ctx: &FeedbackContext<'_>) -> Direction {
        let open = ctx.view.open_sockets_len(ctx.name);
        let max_sockets = ctx.view.max_sockets();

        // 1. No sockets for `name`, or the endpoint has spare capacity: +1.
        if open == 0 || max_sockets.saturating_sub(open) > 0 {
            return 1;
        }

        // 2. Pending queue for `name` is badly backed up: -1.
        if ctx.view.pending_len(ctx.name) > 1000 {
            return -1;
        }

        // 3. A successful-range HTTP status: +1. Otherwise: -1.
        match outcome {
            Outcome::Status(code) if (200..400).contains(code) => 1,
            _ => -1,
        }
    }

    fn clone_box(&self) -> Box<dyn RateDirection> {
        Box::new(*self)
    }
}

impl Clone for Box<dyn RateDirection> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SocketPool;

    fn ctx<'a>(pool: &'a SocketPool, name: &'a str, average_time_ms: f64) -> FeedbackContext<'a> {
        FeedbackContext {
            name,
            view: pool,
            average_time_ms,
        }
    }

    #[tokio::test]
    async fn no_sockets_at_all_is_always_plus_one() {
        let pool = SocketPool::new(10);
        let direction = DefaultRateDirection;
        let c = ctx(&pool, "h:1:", 0.0);
        assert_eq!(direction.classify(&Outcome::ErrorCode("ETIMEDOUT".into()), &c), 1);
    }

    #[tokio::test]
    async fn spare_capacity_is_plus_one_even_on_error() {
        let pool = SocketPool::new(10);
        let _lease = pool.acquire("h:1:", 0).await;
        let direction = DefaultRateDirection;
        let c = ctx(&pool, "h:1:", 0.0);
        assert_eq!(direction.classify(&Outcome::ErrorCode("ECONNRESET".into()), &c), 1);
    }

    #[tokio::test]
    async fn status_code_decides_at_full_capacity() {
        let pool = SocketPool::new(1);
        let _lease = pool.acquire("h:1:", 0).await; // open == max_sockets, no spare capacity
        let direction = DefaultRateDirection;
        let c = ctx(&pool, "h:1:", 0.0);
        assert_eq!(direction.classify(&Outcome::Status(200), &c), 1);
        assert_eq!(direction.classify(&Outcome::Status(503), &c), -1);
    }

    #[test]
    fn clone_box_round_trips() {
        let boxed: Box<dyn RateDirection> = Box::new(DefaultRateDirection);
        let cloned = boxed.clone();
        let c = FeedbackContext {
            name: "h:1:",
            view: &SocketPool::new(1),
            average_time_ms: 0.0,
        };
        assert_eq!(cloned.classify(&Outcome::Status(200), &c), 1);
    }
}
