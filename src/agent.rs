//! Component E: the public throttle agent.
//!
//! Wraps a [`Transport`] by composition, the way §9's re-architecture guidance asks for
//! ("model throttling as a composition ... rather than through inheritance") instead of
//! the source's HTTP/HTTPS mixin. Mirrors
//! `mcpkit-transport`'s `middleware::rate_limit::RateLimitedTransport` shape: one
//! wrapper struct holding the inner transport plus the throttling state, exposing the
//! same request-submission surface.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_lock::Mutex as AsyncMutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::admission::{self, AdmissionLimits, Decision};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::feedback::{FeedbackContext, Outcome};
use crate::limiter::Limiter;
use crate::registry::{Registry, CLEANUP_TIME};
use crate::stats::EndpointStats;
use crate::transport::{endpoint_key, Transport, TransportView};

/// Emitted whenever a limiter completes a rate-adjustment interval (§6 "Event `stat`").
/// Resolves §9's unelaborated `stat` event as a `tokio::sync::broadcast` channel
/// subscribers can opt into; see `DESIGN.md`.
#[derive(Debug, Clone)]
pub struct StatEvent {
    /// The endpoint label this recomputation happened for (flag if set, else name).
    pub label: String,
    /// Working limit before the recomputation.
    pub previous_limit: u64,
    /// Working limit after the recomputation.
    pub new_limit: u64,
}

/// Wraps a `T: Transport` with adaptive, per-endpoint admission control (§1's "adaptive
/// admission controller").
pub struct ThrottleAgent<T: Transport> {
    transport: T,
    config: AgentConfig,
    registry: Registry,
    last_cleanup: AsyncMutex<Instant>,
    stat_tx: broadcast::Sender<StatEvent>,
}

impl<T: Transport> ThrottleAgent<T> {
    /// Wrap `transport`, applying `config` (§6 "Constructor accepting transport options
    /// plus the configuration table").
    #[must_use]
    pub fn new(transport: T, config: AgentConfig) -> Self {
        let (stat_tx, _) = broadcast::channel(64);
        Self {
            transport,
            config,
            registry: Registry::new(),
            last_cleanup: AsyncMutex::new(Instant::now()),
            stat_tx,
        }
    }

    /// The wrapped transport, for callers that need to build requests against it.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Subscribe to interval-completion notifications (§6 event `stat`).
    pub fn subscribe_stats(&self) -> broadcast::Receiver<StatEvent> {
        self.stat_tx.subscribe()
    }

    fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_pending: self.config.max_pending,
            max_buffer: self.config.max_buffer,
        }
    }

    async fn limiter_for(&self, name: &str, flag: &str) -> std::sync::Arc<Limiter> {
        let target = self.config.resolve_rate(name, flag);
        self.registry
            .get(name, flag, target, self.config.rate_interval)
            .await
    }

    /// Pre-check path (§4.3 `canAcceptRequest`): only meaningful when
    /// `check_before_request` is enabled, in which case it runs the full three-rule
    /// decision and, per §9 open question 2's resolution (option (b): matches source
    /// behavior most closely), consumes a token on the accepted path. When
    /// `check_before_request` is disabled this always returns `true` (§4.3: "Only
    /// callable when `checkBeforeRequest` mode is enabled; otherwise returns `true`").
    pub async fn can_accept_request(&self, url: &Url) -> bool {
        if !self.config.check_before_request {
            return true;
        }
        let name = endpoint_key(url);
        let flag = (self.config.get_flag)(url);
        let limiter = self.limiter_for(&name, &flag).await;
        let decision = admission::decide(
            &limiter,
            self.transport.view(),
            &name,
            self.admission_limits(),
            true,
        )
        .await;
        decision == Decision::Admit
    }

    /// Submit `request` through the admission controller and the wrapped transport
    /// (§4.5 "Behavior on `submit`"). `timeout` mirrors `info.timeout`: if set, the
    /// agent arms a one-shot timer that aborts the request if it fires first.
    ///
    /// Returns [`AgentError::Rejected`] if admission control rejects the request
    /// (synthetic 429, §4.3/§6), [`AgentError::Timeout`] if the armed timer fires
    /// first, or the transport's own error (converted via `Into<AgentError>`)
    /// otherwise.
    pub async fn submit(
        &self,
        request: T::Request,
        timeout: Option<Duration>,
    ) -> Result<T::Response, AgentError> {
        let name = self.transport.name_of(&request);
        let flag = (self.config.get_flag)(self.transport.url_of(&request));
        let label = if flag.is_empty() { name.clone() } else { flag.clone() };

        // Step 2 (§4.5): on-submit admission check, skipped when the caller is
        // expected to have already run `can_accept_request` (§9 open question 2,
        // option (b)).
        if !self.config.check_before_request {
            let limiter = self.limiter_for(&name, &flag).await;
            let decision = admission::decide(
                &limiter,
                self.transport.view(),
                &name,
                self.admission_limits(),
                false,
            )
            .await;
            if decision == Decision::Reject {
                warn!(endpoint = %name, "admission rejected, surfacing synthetic 429");
                return Err(AgentError::rejected());
            }
        }

        let limiter = self.limiter_for(&name, &flag).await;
        let start = Instant::now();

        let outcome_result: Result<(u16, T::Response), AgentError> = if let Some(budget) = timeout
        {
            match tokio::time::timeout(budget, self.transport.submit(&name, request)).await {
                Ok(inner) => inner.map_err(Into::into),
                Err(_) => Err(AgentError::Timeout { after: budget }),
            }
        } else {
            self.transport.submit(&name, request).await.map_err(Into::into)
        };

        limiter.add_time(start.elapsed()).await;

        let outcome = match &outcome_result {
            Ok((status, _)) => Outcome::Status(*status),
            Err(err) => err
                .feedback_code()
                .map(|code| Outcome::ErrorCode(code.to_string()))
                .unwrap_or(Outcome::Aborted),
        };

        self.record_outcome(&limiter, &name, &flag, &label, outcome)
            .await;
        self.maybe_cleanup().await;

        outcome_result.map(|(_, response)| response)
    }

    /// Component D (§4.4): classify the outcome, fold it into the limiter's tallies,
    /// and recompute the limit at interval boundaries. Any panic inside the
    /// (caller-pluggable) classifier is caught and treated as "no change" (§7:
    /// "any exception inside the rate-direction function ... is logged and suppressed
    /// so that one bad callback does not destabilize the pool").
    async fn record_outcome(
        &self,
        limiter: &Limiter,
        name: &str,
        flag: &str,
        label: &str,
        outcome: Outcome,
    ) {
        let ctx = FeedbackContext {
            name,
            view: self.transport.view(),
            average_time_ms: limiter.average_time_ms().await,
        };
        let classifier = &self.config.rate_direction;
        let direction = std::panic::catch_unwind(AssertUnwindSafe(|| {
            classifier.classify(&outcome, &ctx)
        }))
        .unwrap_or_else(|_| {
            warn!(endpoint = %name, "rate-direction classifier panicked; treating outcome as neutral");
            0
        });

        let target = self.config.resolve_rate(name, flag);
        let recomputation = limiter
            .record_feedback(
                Instant::now(),
                direction,
                self.config.rate_interval,
                target,
                self.config.rate_lower_weight,
                self.config.rate_lower_koef,
                self.config.rate_raise_koef,
            )
            .await;

        if let Some(r) = recomputation {
            if r.new_limit < r.previous_limit {
                warn!(
                    endpoint = %name,
                    previous_limit = r.previous_limit,
                    new_limit = r.new_limit,
                    "rate collapsed"
                );
            } else if r.new_limit != r.previous_limit {
                debug!(
                    endpoint = %name,
                    previous_limit = r.previous_limit,
                    new_limit = r.new_limit,
                    "rate increased"
                );
            }
            let _ = self.stat_tx.send(StatEvent {
                label: label.to_string(),
                previous_limit: r.previous_limit,
                new_limit: r.new_limit,
            });
        }
    }

    /// §4.5 "Behavior on `removeSocket`": opportunistically sweep idle limiters once
    /// per [`CLEANUP_TIME`], piggybacked on request completion rather than a timer
    /// thread (§5 "Opportunistic cleanup").
    async fn maybe_cleanup(&self) {
        let now = Instant::now();
        let mut last = self.last_cleanup.lock().await;
        if now.saturating_duration_since(*last) < CLEANUP_TIME {
            return;
        }
        *last = now;
        drop(last);

        let view = self.transport.view();
        self.registry.cleanup(now, |name| view.is_idle(name)).await;
    }

    /// Snapshot every tracked endpoint's stats (§6 `getStats()`), keyed by label (flag
    /// if set, else name).
    pub async fn get_stats(&self) -> HashMap<String, EndpointStats> {
        let view = self.transport.view();
        let mut out = HashMap::new();
        for limiter in self.registry.snapshot().await {
            let stat = limiter.stat().await;
            out.insert(
                limiter.label().to_string(),
                EndpointStats {
                    accepted: stat.accepted,
                    incoming: stat.incoming,
                    rate: stat.limit,
                    average_time_ms: stat.average_time_ms,
                    used: view.open_sockets_len(limiter.name()),
                    free: view.free_sockets_len(limiter.name()),
                    pending: view.pending_len(limiter.name()),
                    buffer_size: view.avg_buffer_size(limiter.name()),
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SocketPool;
    use std::sync::Arc;

    #[derive(Clone)]
    struct StubTransport {
        pool: Arc<SocketPool>,
        status: u16,
    }

    impl Transport for StubTransport {
        type Request = Url;
        type Response = ();
        type Error = AgentError;

        fn name_of(&self, request: &Url) -> String {
            endpoint_key(request)
        }

        fn url_of(&self, request: &Url) -> &Url {
            request
        }

        fn approx_body_len(&self, _request: &Url) -> u64 {
            0
        }

        fn view(&self) -> &dyn TransportView {
            self.pool.as_ref()
        }

        async fn submit(&self, name: &str, _request: Url) -> Result<(u16, ()), AgentError> {
            let lease = self.pool.acquire(name, 0).await;
            lease.complete();
            Ok((self.status, ()))
        }
    }

    fn stub(status: u16) -> ThrottleAgent<StubTransport> {
        ThrottleAgent::new(
            StubTransport {
                pool: Arc::new(SocketPool::new(50)),
                status,
            },
            AgentConfig::new().rate(100),
        )
    }

    #[tokio::test]
    async fn get_stats_on_a_fresh_agent_is_empty() {
        let agent = stub(200);
        assert!(agent.get_stats().await.is_empty());
    }

    #[tokio::test]
    async fn one_admitted_200_reports_accepted_one() {
        let agent = stub(200);
        let url = Url::parse("http://h:1/").unwrap();
        agent.submit(url, None).await.unwrap();

        let stats = agent.get_stats().await;
        let entry = stats.get("h:1:").expect("endpoint present after one request");
        assert_eq!(entry.accepted, 1);
        assert_eq!(entry.incoming, 1);
        assert!(entry.used <= 1);
    }

    #[tokio::test]
    async fn submission_rejected_once_the_token_bucket_is_exhausted() {
        let agent = stub(200);
        // Force the working limit to its floor so the very next submit is rejected.
        let limiter = agent.limiter_for("h:1:", "").await;
        limiter.set_limit(crate::limiter::MIN_RATE).await;
        assert!(limiter.accept(crate::limiter::MIN_RATE).await);

        let url = Url::parse("http://h:1/").unwrap();
        let err = agent.submit(url, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::AgentErrorKind::Rejected);
    }

    #[tokio::test]
    async fn stat_event_fires_when_a_rate_adjustment_boundary_is_crossed() {
        let agent = stub(200);
        let mut rx = agent.subscribe_stats();
        let limiter = agent.limiter_for("h:1:", "").await;
        // Push the boundary into the past so the very next outcome recomputes.
        limiter
            .record_feedback(
                Instant::now() - Duration::from_secs(10),
                0,
                Duration::from_millis(1),
                100,
                18,
                0.2,
                0.02,
            )
            .await;

        let url = Url::parse("http://h:1/").unwrap();
        agent.submit(url, None).await.unwrap();

        let event = rx.try_recv().expect("a stat event should have fired");
        assert_eq!(event.label, "h:1:");
    }
}
