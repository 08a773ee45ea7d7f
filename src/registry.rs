//! Component B: the limiter registry.
//!
//! Grounded on `mcpkit-transport`'s `pool::manager::Pool` — specifically its
//! lock discipline (hold the map lock only long enough to fetch-or-create, release
//! before touching the thing inside) and its use of `async_lock::RwLock` for the shared
//! map with `Arc<...>` entries so callers can keep using a limiter after releasing the
//! registry lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_lock::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::limiter::Limiter;

/// How long a limiter's interval must have been idle before it becomes a cleanup
/// candidate (§3 "Lifecycles", §4.2 `cleanup`).
pub const CLEANUP_TIME: Duration = Duration::from_secs(60);

/// Composite key a limiter is stored under: `name + flag` (§3 "Endpoint key").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointKey {
    name: String,
    flag: String,
}

/// Maps endpoint keys to their limiters, creating entries on demand and expiring idle
/// ones (§4.2).
pub struct Registry {
    limiters: RwLock<HashMap<EndpointKey, Arc<Limiter>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// Return the limiter for `(name, flag)`, creating it with `target_rate` as its
    /// initial limit if absent. On every call (including the creating one) the
    /// limiter's notion of the caller's target rate is refreshed via
    /// [`Limiter::observe_target_rate`] — a lowered cap takes effect immediately, a
    /// raised cap does not inflate the current working limit (§4.2).
    pub async fn get(
        &self,
        name: &str,
        flag: &str,
        target_rate: u64,
        default_interval: Duration,
    ) -> Arc<Limiter> {
        let key = EndpointKey {
            name: name.to_string(),
            flag: flag.to_string(),
        };

        // Fast path: the common case is "limiter already exists" — take only a read
        // lock, matching the registry-lock discipline in §5.
        if let Some(limiter) = self.limiters.read().await.get(&key) {
            let limiter = Arc::clone(limiter);
            limiter.observe_target_rate(target_rate).await;
            return limiter;
        }

        let mut limiters = self.limiters.write().await;
        // Re-check under the write lock: another task may have created it between the
        // read-lock release above and this write-lock acquire.
        let limiter = limiters
            .entry(key)
            .or_insert_with(|| {
                debug!(name, flag, target_rate, "creating new endpoint limiter");
                Arc::new(Limiter::new(
                    name.to_string(),
                    flag.to_string(),
                    target_rate,
                    default_interval,
                ))
            })
            .clone();
        drop(limiters);

        limiter.observe_target_rate(target_rate).await;
        limiter
    }

    /// Look up a limiter without creating one.
    pub async fn peek(&self, name: &str, flag: &str) -> Option<Arc<Limiter>> {
        let key = EndpointKey {
            name: name.to_string(),
            flag: flag.to_string(),
        };
        self.limiters.read().await.get(&key).cloned()
    }

    /// All currently registered limiters, for `getStats()`.
    pub async fn snapshot(&self) -> Vec<Arc<Limiter>> {
        self.limiters.read().await.values().cloned().collect()
    }

    /// Remove every limiter whose interval has been idle for at least
    /// [`CLEANUP_TIME`] *and* whose endpoint the transport reports as fully idle
    /// (`is_idle` returns `true` for its `name`) — never removes a limiter the
    /// transport still has sockets or pending requests for (§3 invariant, §8 property
    /// 4).
    pub async fn cleanup(&self, now: Instant, is_idle: impl Fn(&str) -> bool) {
        // Collect candidates under a read lock first so the (possibly
        // caller-supplied, non-trivial) `is_idle` check never runs while holding the
        // write lock.
        let candidates: Vec<(EndpointKey, Arc<Limiter>)> = {
            let limiters = self.limiters.read().await;
            let mut out = Vec::new();
            for (key, limiter) in limiters.iter() {
                if limiter.idle_since(now, CLEANUP_TIME).await && is_idle(&key.name) {
                    out.push((key.clone(), Arc::clone(limiter)));
                }
            }
            out
        };

        if candidates.is_empty() {
            return;
        }

        let mut limiters = self.limiters.write().await;
        for (key, limiter) in candidates {
            // Re-check idleness under the write lock: a concurrent request may have
            // started using this endpoint since the read-lock snapshot above.
            if limiter.idle_since(now, CLEANUP_TIME).await && is_idle(&key.name) {
                debug!(name = %key.name, flag = %key.flag, "cleaning up idle limiter");
                limiters.remove(&key);
            }
        }
    }

    /// Number of limiters currently tracked.
    pub async fn len(&self) -> usize {
        self.limiters.read().await.len()
    }

    /// Whether the registry holds no limiters.
    pub async fn is_empty(&self) -> bool {
        self.limiters.read().await.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_creates_on_first_call_and_reuses_after() {
        let reg = Registry::new();
        let a = reg.get("h:1:", "", 100, Duration::from_millis(1000)).await;
        let b = reg.get("h:1:", "", 100, Duration::from_millis(1000)).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_flags_get_distinct_limiters() {
        let reg = Registry::new();
        let a = reg.get("h:1:", "read", 100, Duration::from_millis(1000)).await;
        let b = reg.get("h:1:", "write", 100, Duration::from_millis(1000)).await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn lowering_target_rate_reclamps_on_next_get() {
        let reg = Registry::new();
        let l = reg.get("h:1:", "", 100, Duration::from_millis(1000)).await;
        l.set_limit(80).await;
        // Scenario S6: limit=80, lastRate=100, getRate now returns 50.
        let l2 = reg.get("h:1:", "", 50, Duration::from_millis(1000)).await;
        assert!(Arc::ptr_eq(&l, &l2));
        assert_eq!(l.stat().await.limit, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_never_removes_an_endpoint_the_transport_still_uses() {
        let reg = Registry::new();
        reg.get("busy:1:", "", 100, Duration::from_millis(1000))
            .await;
        tokio::time::advance(CLEANUP_TIME + Duration::from_secs(1)).await;

        reg.cleanup(Instant::now(), |_name| false).await;
        assert_eq!(reg.len().await, 1, "still-busy endpoint must survive cleanup");
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_idle_expired_limiters() {
        let reg = Registry::new();
        reg.get("idle:1:", "", 100, Duration::from_millis(1000))
            .await;
        tokio::time::advance(CLEANUP_TIME + Duration::from_secs(1)).await;

        reg.cleanup(Instant::now(), |_name| true).await;
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn cleanup_before_cleanup_time_elapses_is_a_no_op() {
        let reg = Registry::new();
        reg.get("h:1:", "", 100, Duration::from_millis(1000)).await;
        reg.cleanup(Instant::now(), |_name| true).await;
        assert_eq!(reg.len().await, 1);
    }
}
