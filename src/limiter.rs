//! Component A: the per-endpoint token-bucket limiter.
//!
//! Mirrors the counter-bundling approach in `mcpkit-transport`'s
//! `middleware::rate_limit::RateLimiterState`, but keeps every field behind one lock
//! instead of a handful of atomics — the limiter here has cross-field invariants
//! (`accepted <= incoming`, clamp-on-`setLimit`) that only hold if mutations are
//! serialized together, whereas the teacher's token bucket has none.

use std::time::Duration;

use async_lock::Mutex;
use tokio::time::Instant;

/// Minimum permitted working rate. A limiter never throttles an endpoint to zero.
pub const MIN_RATE: u64 = 1;
/// Maximum permitted working rate.
pub const MAX_RATE: u64 = 1_000_000;
/// Average-latency threshold (ms) the buffer-pressure gate uses to relax its cap.
pub const AVG_TIME_THRESHOLD_MS: f64 = 400.0;
/// Default accounting window.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1000);

/// Smoothing factor for the exponential moving average in [`LimiterState::add_time`].
/// Not specified exactly by the source; the only required property (per spec §4.1) is
/// that sustained large samples push the average up and sustained small samples pull it
/// down, which any EWMA with `0 < ALPHA < 1` satisfies.
const AVG_TIME_ALPHA: f64 = 0.2;

/// A point-in-time snapshot of a limiter's counters, returned by [`Limiter::stat`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterStat {
    /// Tokens accepted so far in the current interval.
    pub accepted: u64,
    /// Tokens requested (accepted + rejected) so far in the current interval.
    pub incoming: u64,
    /// Current working limit.
    pub limit: u64,
    /// Smoothed average observed request duration, in milliseconds.
    pub average_time_ms: f64,
}

/// Outcome of a rate recomputation at a rate-adjustment boundary (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecomputation {
    /// Limit before this recomputation.
    pub previous_limit: u64,
    /// Limit after this recomputation (equal to `previous_limit` if `diff == 0`).
    pub new_limit: u64,
}

struct LimiterState {
    limit: u64,
    interval: Duration,
    interval_start: Instant,
    accepted: u64,
    incoming: u64,
    average_time_ms: f64,
    success: u64,
    failed: u64,
    last_rate: u64,
    last_rate_time: Instant,
}

impl LimiterState {
    /// Roll the interval forward if it has elapsed. Lazy, idempotent: a call that lands
    /// mid-interval is a no-op; a call that lands after one or many missed windows jumps
    /// straight to `now` rather than emitting one rollover per missed window (§4.1).
    fn rollover(&mut self, now: Instant) {
        if now >= self.interval_start + self.interval {
            self.interval_start = now;
            self.accepted = 0;
            self.incoming = 0;
        }
    }
}

/// One endpoint's admission-control state: the token bucket (component A) plus the
/// feedback tallies the source patches onto it at runtime. Per §9's re-architecture
/// guidance, both live in this one first-class type instead of being layered on after
/// construction.
pub struct Limiter {
    /// Endpoint key without flag (§3: "Endpoint key").
    name: String,
    /// Caller-supplied grouping label, or `""`.
    flag: String,
    state: Mutex<LimiterState>,
}

impl Limiter {
    /// Create a new limiter for `(name, flag)`, seeded with `initial_rate` as both the
    /// working limit and `lastRate` (registry `get()`'s creation path, §4.2).
    pub(crate) fn new(name: String, flag: String, initial_rate: u64, interval: Duration) -> Self {
        let now = Instant::now();
        let limit = initial_rate.clamp(MIN_RATE, MAX_RATE);
        Self {
            name,
            flag,
            state: Mutex::new(LimiterState {
                limit,
                interval,
                interval_start: now,
                accepted: 0,
                incoming: 0,
                average_time_ms: 0.0,
                success: 0,
                failed: 0,
                last_rate: initial_rate,
                last_rate_time: now,
            }),
        }
    }

    /// Endpoint name (host:port, without flag).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Grouping flag, `""` if none was supplied.
    #[must_use]
    pub fn flag(&self) -> &str {
        &self.flag
    }

    /// The label `getStats()` keys this endpoint under: the flag if non-empty, else the
    /// name (§6).
    #[must_use]
    pub fn label(&self) -> &str {
        if self.flag.is_empty() {
            &self.name
        } else {
            &self.flag
        }
    }

    /// Attempt to consume `n` tokens from the current interval (§4.1 `accept`).
    ///
    /// Always increments `incoming`. Increments `accepted` and returns `true` iff
    /// `accepted + n <= limit` after any due rollover.
    pub async fn accept(&self, n: u64) -> bool {
        self.accept_at(Instant::now(), n).await
    }

    pub(crate) async fn accept_at(&self, now: Instant, n: u64) -> bool {
        let mut state = self.state.lock().await;
        state.rollover(now);
        state.incoming += n;
        if state.accepted + n <= state.limit {
            state.accepted += n;
            true
        } else {
            false
        }
    }

    /// Clamp `new_limit` to `[MIN_RATE, MAX_RATE]` and install it, effective
    /// immediately for subsequent `accept` calls in the current interval (§4.1
    /// `setLimit`).
    pub async fn set_limit(&self, new_limit: u64) {
        let mut state = self.state.lock().await;
        state.limit = new_limit.clamp(MIN_RATE, MAX_RATE);
    }

    /// Fold an observed request duration into the smoothed average (§4.1 `addTime`).
    pub async fn add_time(&self, elapsed: Duration) {
        let mut state = self.state.lock().await;
        let sample = elapsed.as_secs_f64() * 1000.0;
        state.average_time_ms =
            state.average_time_ms * (1.0 - AVG_TIME_ALPHA) + sample * AVG_TIME_ALPHA;
    }

    /// Snapshot of `{accepted, incoming, limit, averageTime}` (§4.1 `getStat`).
    pub async fn stat(&self) -> LimiterStat {
        let mut state = self.state.lock().await;
        state.rollover(Instant::now());
        LimiterStat {
            accepted: state.accepted,
            incoming: state.incoming,
            limit: state.limit,
            average_time_ms: state.average_time_ms,
        }
    }

    /// Whether this limiter has admitted at least one token in the current interval.
    /// Used by the buffer-pressure gate (§4.3 rule 2) and §9 open question 3: a cold
    /// interval exempts its first request from the buffer gate.
    pub(crate) async fn has_admitted_this_interval(&self) -> bool {
        let mut state = self.state.lock().await;
        state.rollover(Instant::now());
        state.accepted > 0
    }

    /// Current smoothed average latency, in milliseconds.
    pub(crate) async fn average_time_ms(&self) -> f64 {
        self.state.lock().await.average_time_ms
    }

    /// Whether this limiter's current interval started long enough ago to be a cleanup
    /// candidate (§4.2 `cleanup`: `intervalStart + CLEANUP_TIME < now`).
    pub(crate) async fn idle_since(&self, now: Instant, cleanup_time: Duration) -> bool {
        self.state.lock().await.interval_start + cleanup_time < now
    }

    /// The target rate last observed from the caller's `getRate` function.
    pub(crate) async fn last_rate(&self) -> u64 {
        self.state.lock().await.last_rate
    }

    /// Record `n` requests as seen (`incoming`) without attempting to admit them.
    /// Used by the admission controller's queue-depth and buffer-pressure gates
    /// (§4.3 rules 1–2), which reject before ever calling [`Limiter::accept`].
    pub(crate) async fn bump_incoming(&self, now: Instant, n: u64) {
        let mut state = self.state.lock().await;
        state.rollover(now);
        state.incoming += n;
    }

    /// Record a rejection as feedback (§4.3: "if `withFailed`, increment `failed`"),
    /// independent of the rate-recomputation bookkeeping in [`Limiter::record_feedback`].
    pub(crate) async fn bump_failed(&self) {
        self.state.lock().await.failed += 1;
    }

    /// Registry `get()`'s re-clamp step (§4.2): record a new target and, if it's lower
    /// than the current working limit, clamp the limit down immediately. Raising the
    /// target never inflates the working limit — it only removes a ceiling the feedback
    /// loop may later climb into.
    pub(crate) async fn observe_target_rate(&self, target: u64) {
        let mut state = self.state.lock().await;
        if target != state.last_rate {
            state.last_rate = target;
            let clamped = state.limit.min(target).clamp(MIN_RATE, MAX_RATE);
            state.limit = clamped;
        }
    }

    /// Component D step 2: record a `+1`/`-1`/`0` feedback classification, and if the
    /// rate-adjustment window has elapsed, recompute the limit (§4.4) and reset the
    /// tallies. Bundled into one locked critical section so the recomputation sees a
    /// consistent `success`/`failed` pair.
    pub(crate) async fn record_feedback(
        &self,
        now: Instant,
        direction: i8,
        rate_interval: Duration,
        target: u64,
        lower_weight: u64,
        lower_koef: f64,
        raise_koef: f64,
    ) -> Option<RateRecomputation> {
        let mut state = self.state.lock().await;
        match direction {
            1 => state.success += 1,
            -1 => state.failed += 1,
            _ => {}
        }

        if now < state.last_rate_time + rate_interval {
            return None;
        }

        let previous_limit = state.limit;
        let diff = state.success as i64 - (state.failed as i64) * (lower_weight as i64);

        let new_limit = if diff == 0 {
            previous_limit
        } else {
            let koef = if diff < 0 { lower_koef } else { raise_koef };
            let step = ((previous_limit as f64) * koef).floor().max(1.0) as u64;
            let signed = if diff < 0 {
                previous_limit.saturating_sub(step)
            } else {
                previous_limit.saturating_add(step)
            };
            signed.clamp(MIN_RATE, target.clamp(MIN_RATE, MAX_RATE))
        };

        state.limit = new_limit;
        state.success = 0;
        state.failed = 0;
        state.last_rate_time = now;

        Some(RateRecomputation {
            previous_limit,
            new_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64) -> Limiter {
        Limiter::new("h:1:".into(), String::new(), limit, DEFAULT_INTERVAL)
    }

    #[tokio::test]
    async fn accept_admits_up_to_limit_and_rejects_beyond() {
        let l = limiter(3);
        assert!(l.accept(1).await);
        assert!(l.accept(1).await);
        assert!(l.accept(1).await);
        assert!(!l.accept(1).await);

        let stat = l.stat().await;
        assert_eq!(stat.accepted, 3);
        assert_eq!(stat.incoming, 4);
        assert!(stat.accepted <= stat.limit);
    }

    #[tokio::test]
    async fn set_limit_clamps_to_bounds() {
        let l = limiter(10);
        l.set_limit(0).await;
        assert_eq!(l.stat().await.limit, MIN_RATE);

        l.set_limit(MAX_RATE + 1000).await;
        assert_eq!(l.stat().await.limit, MAX_RATE);
    }

    #[tokio::test]
    async fn lowering_limit_rejects_immediately_within_interval() {
        let l = limiter(10);
        assert!(l.accept(5).await);
        l.set_limit(5).await;
        // accepted is already at the new limit; no more tokens this interval.
        assert!(!l.accept(1).await);
    }

    #[tokio::test]
    async fn observe_target_rate_only_clamps_down_never_inflates() {
        let l = limiter(80);
        l.observe_target_rate(100).await;
        assert_eq!(l.stat().await.limit, 80, "raising target must not inflate limit");

        l.observe_target_rate(50).await;
        assert_eq!(l.stat().await.limit, 50, "lowering target clamps limit down");
    }

    #[tokio::test]
    async fn diff_zero_leaves_limit_unchanged() {
        let l = limiter(100);
        let now = Instant::now();
        // success == failed * weight == 0 -> diff == 0
        let tick = l
            .record_feedback(now + DEFAULT_INTERVAL, 0, DEFAULT_INTERVAL, 1_000_000, 18, 0.2, 0.02)
            .await;
        assert_eq!(
            tick,
            Some(RateRecomputation {
                previous_limit: 100,
                new_limit: 100
            })
        );
    }

    #[tokio::test]
    async fn collapse_on_errors_matches_scenario_s2() {
        let l = limiter(100);
        let now = Instant::now();
        for _ in 0..10 {
            l.record_feedback(now, 1, DEFAULT_INTERVAL, 1_000_000, 18, 0.2, 0.02)
                .await;
        }
        for _ in 0..4 {
            l.record_feedback(now, -1, DEFAULT_INTERVAL, 1_000_000, 18, 0.2, 0.02)
                .await;
        }
        let tick = l
            .record_feedback(
                now + DEFAULT_INTERVAL,
                -1,
                DEFAULT_INTERVAL,
                1_000_000,
                18,
                0.2,
                0.02,
            )
            .await
            .unwrap();
        // success=10, failed=5, diff = 10 - 5*18 = -80 < 0, step = floor(100*0.2)=20
        assert_eq!(tick.previous_limit, 100);
        assert_eq!(tick.new_limit, 80);
    }

    #[tokio::test]
    async fn decrease_floors_at_min_rate() {
        let l = limiter(MIN_RATE);
        let now = Instant::now();
        for _ in 0..5 {
            l.record_feedback(now, -1, DEFAULT_INTERVAL, 1_000_000, 18, 0.2, 0.02)
                .await;
        }
        let tick = l
            .record_feedback(
                now + DEFAULT_INTERVAL,
                -1,
                DEFAULT_INTERVAL,
                1_000_000,
                18,
                0.2,
                0.02,
            )
            .await
            .unwrap();
        assert_eq!(tick.new_limit, MIN_RATE);
    }

    #[tokio::test]
    async fn add_time_pulls_average_toward_samples() {
        let l = limiter(10);
        for _ in 0..20 {
            l.add_time(Duration::from_millis(1000)).await;
        }
        assert!(l.average_time_ms().await > AVG_TIME_THRESHOLD_MS);

        let l2 = limiter(10);
        for _ in 0..20 {
            l2.add_time(Duration::from_millis(10)).await;
        }
        assert!(l2.average_time_ms().await < AVG_TIME_THRESHOLD_MS);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_rollover_is_lazy_and_resets_counters() {
        let l = limiter(5);
        assert!(l.accept(5).await);
        assert!(!l.accept(1).await);

        tokio::time::advance(DEFAULT_INTERVAL + Duration::from_millis(1)).await;

        // A missed window collapses into a single rollover; counters reset.
        assert!(l.accept(1).await);
        let stat = l.stat().await;
        assert_eq!(stat.accepted, 1);
        assert_eq!(stat.incoming, 1);
    }
}
