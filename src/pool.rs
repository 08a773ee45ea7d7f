//! Per-endpoint socket and queue bookkeeping the transport adapter exposes to admission
//! control and the feedback engine (§6 "Consumed transport interface").
//!
//! Grounded on `mcpkit-transport`'s `pool::manager::Pool`: a capacity gate (their
//! `available`/`in_use` bookkeeping under one lock, here a [`tokio::sync::Semaphore`]
//! per endpoint) plus atomic counters for the numbers that are read far more often than
//! written (their `RateLimiterState` uses the same atomics-over-locks trade-off for
//! metrics). `reqwest` does not expose kernel socket send-buffer occupancy, so
//! `bufferSize` here is approximated as the sum of in-flight request body sizes divided
//! by the number of sockets currently open for that endpoint — documented as a
//! deliberate approximation, not a claim of byte-for-byte fidelity to a real send
//! buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

fn dec_saturating(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
}

/// One endpoint's socket/queue bookkeeping.
struct EndpointPool {
    /// Gates true concurrency at `max_sockets`; acquiring a permit is what moves a
    /// request from "pending" to "open".
    permits: Arc<Semaphore>,
    open: AtomicUsize,
    free: AtomicUsize,
    pending: AtomicUsize,
    buffer_bytes_sum: AtomicU64,
    buffer_inflight: AtomicUsize,
}

impl EndpointPool {
    fn new(max_sockets: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_sockets)),
            open: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            buffer_bytes_sum: AtomicU64::new(0),
            buffer_inflight: AtomicUsize::new(0),
        }
    }

    fn avg_buffer_size(&self) -> u64 {
        let inflight = self.buffer_inflight.load(Ordering::Relaxed);
        if inflight == 0 {
            0
        } else {
            self.buffer_bytes_sum.load(Ordering::Relaxed) / inflight as u64
        }
    }

    fn is_idle(&self) -> bool {
        self.open.load(Ordering::Relaxed) == 0
            && self.free.load(Ordering::Relaxed) == 0
            && self.pending.load(Ordering::Relaxed) == 0
    }
}

/// A lease on one of an endpoint's `max_sockets` slots, held for the lifetime of one
/// in-flight request.
///
/// Dropping a lease without calling [`SocketLease::complete`] treats the underlying
/// socket as destroyed rather than returned to the free pool — this is how the abort
/// path (§4.5 "if the request has a socket attached, destroy it") falls out naturally
/// from ordinary future cancellation, addressing §9 open question 4: the socket is
/// unconditionally not pooled unless the request reached a normal terminal outcome.
pub struct SocketLease {
    endpoint: Arc<EndpointPool>,
    _permit: OwnedSemaphorePermit,
    bytes: u64,
    completed: bool,
}

impl SocketLease {
    /// Mark this request as having completed normally (response or transport error, as
    /// opposed to an agent-side abort): the socket is returned to the free pool.
    pub fn complete(mut self) {
        self.completed = true;
        dec_saturating(&self.endpoint.open);
        self.endpoint.free.fetch_add(1, Ordering::AcqRel);
        self.release_buffer_sample();
    }

    fn release_buffer_sample(&self) {
        self.endpoint
            .buffer_bytes_sum
            .fetch_sub(self.bytes, Ordering::AcqRel);
        dec_saturating(&self.endpoint.buffer_inflight);
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        if !self.completed {
            dec_saturating(&self.endpoint.open);
            self.release_buffer_sample();
        }
    }
}

/// Tracks open/free/pending sockets and approximate buffer occupancy per endpoint name,
/// shared by the transport adapter, the admission controller, and the feedback engine.
pub struct SocketPool {
    max_sockets: usize,
    endpoints: RwLock<HashMap<String, Arc<EndpointPool>>>,
}

impl SocketPool {
    /// Create a pool in which every endpoint is capped at `max_sockets` concurrently
    /// open connections (§6 `maxSockets`, a single scalar shared across all endpoints).
    #[must_use]
    pub fn new(max_sockets: usize) -> Self {
        Self {
            max_sockets: max_sockets.max(1),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    fn endpoint(&self, name: &str) -> Arc<EndpointPool> {
        if let Some(ep) = self.endpoints.read().unwrap_or_else(|e| e.into_inner()).get(name) {
            return Arc::clone(ep);
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            endpoints
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(EndpointPool::new(self.max_sockets))),
        )
    }

    /// Acquire a socket slot for `name`, queueing (counted in `pending`) if the endpoint
    /// is already at `max_sockets` concurrent connections.
    pub async fn acquire(&self, name: &str, approx_body_bytes: u64) -> SocketLease {
        let endpoint = self.endpoint(name);
        endpoint.pending.fetch_add(1, Ordering::AcqRel);
        let permit = Arc::clone(&endpoint.permits)
            .acquire_owned()
            .await
            .expect("endpoint semaphore is never closed");
        dec_saturating(&endpoint.pending);
        dec_saturating(&endpoint.free);
        endpoint.open.fetch_add(1, Ordering::AcqRel);
        endpoint
            .buffer_bytes_sum
            .fetch_add(approx_body_bytes, Ordering::AcqRel);
        endpoint.buffer_inflight.fetch_add(1, Ordering::AcqRel);

        SocketLease {
            endpoint,
            _permit: permit,
            bytes: approx_body_bytes,
            completed: false,
        }
    }

    /// Remove endpoints with no open, free, or pending sockets from the tracking map
    /// itself, so a long-lived process doesn't accumulate one `HashMap` entry per
    /// endpoint ever seen. Safe to call alongside [`crate::registry::Registry::cleanup`]
    /// since both key off the same idleness definition.
    pub fn sweep(&self) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.retain(|name, ep| {
            let keep = !ep.is_idle();
            if !keep {
                debug!(name, "dropping idle endpoint pool entry");
            }
            keep
        });
    }

    /// Number of open sockets for `name`.
    #[must_use]
    pub fn open_sockets_len(&self, name: &str) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, |ep| ep.open.load(Ordering::Relaxed))
    }

    /// Number of idle, pooled sockets available for immediate reuse for `name`.
    #[must_use]
    pub fn free_sockets_len(&self, name: &str) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, |ep| ep.free.load(Ordering::Relaxed))
    }

    /// Number of requests for `name` queued waiting for a socket slot.
    #[must_use]
    pub fn pending_len(&self, name: &str) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, |ep| ep.pending.load(Ordering::Relaxed))
    }

    /// Approximate average buffer occupancy (bytes) across `name`'s open sockets.
    #[must_use]
    pub fn avg_buffer_size(&self, name: &str) -> u64 {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, EndpointPool::avg_buffer_size)
    }

    /// The shared per-endpoint socket cap.
    #[must_use]
    pub const fn max_sockets(&self) -> usize {
        self.max_sockets
    }

    /// Whether `name` has no open, free, or pending sockets at all (§4.2 `cleanup`
    /// gate, §8 invariant 4). An endpoint never seen by this pool is idle by
    /// definition.
    #[must_use]
    pub fn is_idle(&self, name: &str) -> bool {
        self.endpoints
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .is_none_or(EndpointPool::is_idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_then_complete_moves_open_socket_to_free() {
        let pool = SocketPool::new(4);
        assert!(pool.is_idle("h:1:"));

        let lease = pool.acquire("h:1:", 100).await;
        assert_eq!(pool.open_sockets_len("h:1:"), 1);
        assert_eq!(pool.free_sockets_len("h:1:"), 0);
        assert_eq!(pool.avg_buffer_size("h:1:"), 100);

        lease.complete();
        assert_eq!(pool.open_sockets_len("h:1:"), 0);
        assert_eq!(pool.free_sockets_len("h:1:"), 1);
        assert_eq!(pool.avg_buffer_size("h:1:"), 0);
    }

    #[tokio::test]
    async fn dropping_a_lease_without_completing_does_not_free_the_socket() {
        let pool = SocketPool::new(4);
        let lease = pool.acquire("h:1:", 50).await;
        drop(lease);

        assert_eq!(pool.open_sockets_len("h:1:"), 0);
        assert_eq!(pool.free_sockets_len("h:1:"), 0, "aborted socket must not be pooled");
    }

    #[tokio::test]
    async fn fourth_concurrent_acquire_waits_for_a_permit() {
        let pool = Arc::new(SocketPool::new(2));
        let a = pool.acquire("h:1:", 0).await;
        let b = pool.acquire("h:1:", 0).await;
        assert_eq!(pool.open_sockets_len("h:1:"), 2);

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { pool2.acquire("h:1:", 0).await });
        tokio::task::yield_now().await;
        assert_eq!(pool.pending_len("h:1:"), 1);

        a.complete();
        let c = waiter.await.expect("waiter task panicked");
        assert_eq!(pool.open_sockets_len("h:1:"), 2);
        c.complete();
        b.complete();
    }

    #[tokio::test]
    async fn average_buffer_size_averages_across_open_sockets() {
        let pool = SocketPool::new(4);
        let a = pool.acquire("h:1:", 100).await;
        let b = pool.acquire("h:1:", 300).await;
        assert_eq!(pool.avg_buffer_size("h:1:"), 200);
        a.complete();
        b.complete();
    }

    #[test]
    fn sweep_drops_idle_endpoints_only() {
        let pool = SocketPool::new(4);
        // Force an entry to exist via a blocking acquire on a current-thread runtime.
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let lease = rt.block_on(pool.acquire("busy:1:", 0));
        pool.sweep();
        assert!(!pool.is_idle("busy:1:"), "endpoint with an open socket must survive sweep");

        // Aborting (rather than completing) the lease releases the socket without
        // pooling it, so the endpoint becomes genuinely idle and eligible for sweep.
        drop(lease);
        assert!(pool.is_idle("busy:1:"));
        pool.sweep();
        assert!(pool.is_idle("nonexistent:1:"), "an endpoint never seen is idle by definition");
    }
}
