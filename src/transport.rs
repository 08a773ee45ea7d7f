//! The external collaborator interface (§6 "Consumed transport interface") plus a
//! `reqwest`-backed implementation.
//!
//! `Transport` is generic the same way `mcpkit-transport`'s `Transport` trait is
//! (`http/client.rs`, `middleware/retry.rs`'s `T: Transport`): a plain trait consumed via
//! a type parameter, not a trait object, so wrapping one transport in another costs
//! nothing at runtime and every implementor's associated `Error` is required to convert
//! into this crate's own [`AgentError`] — the same `Into<TransportError>` bound
//! `RetryTransport<T>` places on its inner transport.

use std::sync::Arc;

use reqwest::{Client, Request, Response};
use url::Url;

use crate::error::AgentError;
use crate::pool::SocketPool;

/// Read-only transport-side views the admission controller and feedback engine consult
/// (§6). Snapshots may be stale; every decision built on them is a heuristic, not an
/// exact conservation law (§5).
pub trait TransportView: Send + Sync {
    /// Number of sockets currently open (in use) for `name`.
    fn open_sockets_len(&self, name: &str) -> usize;
    /// Number of idle, pooled sockets immediately reusable for `name`.
    fn free_sockets_len(&self, name: &str) -> usize;
    /// Number of requests for `name` queued waiting for a socket.
    fn pending_len(&self, name: &str) -> usize;
    /// The configured maximum number of concurrent sockets per endpoint.
    fn max_sockets(&self) -> usize;
    /// Approximate average buffer occupancy (bytes) across `name`'s open sockets.
    fn avg_buffer_size(&self, name: &str) -> u64;
    /// Whether `name` has no open, free, or pending sockets at all (§4.2 `cleanup`
    /// gate).
    fn is_idle(&self, name: &str) -> bool {
        self.open_sockets_len(name) == 0
            && self.free_sockets_len(name) == 0
            && self.pending_len(name) == 0
    }
}

impl TransportView for SocketPool {
    fn open_sockets_len(&self, name: &str) -> usize {
        Self::open_sockets_len(self, name)
    }

    fn free_sockets_len(&self, name: &str) -> usize {
        Self::free_sockets_len(self, name)
    }

    fn pending_len(&self, name: &str) -> usize {
        Self::pending_len(self, name)
    }

    fn max_sockets(&self) -> usize {
        Self::max_sockets(self)
    }

    fn avg_buffer_size(&self, name: &str) -> u64 {
        Self::avg_buffer_size(self, name)
    }

    fn is_idle(&self, name: &str) -> bool {
        Self::is_idle(self, name)
    }
}

/// The request-submission side of the external collaborator interface (§4.5, §6).
pub trait Transport: Send + Sync {
    /// The request type this transport accepts.
    type Request: Send;
    /// The response type this transport returns on success.
    type Response: Send;
    /// The error type this transport returns on failure. Must convert into
    /// [`AgentError`] so transport failures propagate unchanged (§7 "Propagation
    /// policy").
    type Error: std::error::Error + Send + Sync + 'static + Into<AgentError>;

    /// Compute the `host:port:` endpoint key for `request` (§3 "Endpoint key", §6
    /// `nameOf`).
    fn name_of(&self, request: &Self::Request) -> String;

    /// The request's destination URL, consulted by [`crate::config::AgentConfig::get_flag`]
    /// (§6 `getFlag(url)`).
    fn url_of(&self, request: &Self::Request) -> &Url;

    /// Approximate request body size in bytes, fed into the buffer-pressure gate's
    /// `bufferSize` approximation.
    fn approx_body_len(&self, request: &Self::Request) -> u64;

    /// Read-only socket/queue views for this transport.
    fn view(&self) -> &dyn TransportView;

    /// Hand `request` off for connection, write, and response (§4.5 `submit`).
    async fn submit(
        &self,
        name: &str,
        request: Self::Request,
    ) -> Result<(u16, Self::Response), Self::Error>;
}

/// Compute the `host:port:` endpoint key for a URL (§3, §6 `nameOf`). Port falls back to
/// the scheme's default (80/443) when the URL doesn't specify one explicitly.
#[must_use]
pub fn endpoint_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    let port = url.port_or_known_default().unwrap_or(0);
    format!("{host}:{port}:")
}

/// A [`Transport`] backed by a real `reqwest::Client`, with per-endpoint socket
/// bookkeeping supplied by [`SocketPool`] since `reqwest` does not expose a per-host
/// connection-pool view on its own (§6's transport interface requires one).
pub struct PooledHttpTransport {
    client: Client,
    pool: Arc<SocketPool>,
}

impl PooledHttpTransport {
    /// Wrap `client`, capping every endpoint at `max_sockets` concurrent connections
    /// for the purposes of admission control's socket views (§6 `maxSockets`).
    #[must_use]
    pub fn new(client: Client, max_sockets: usize) -> Self {
        Self {
            client,
            pool: Arc::new(SocketPool::new(max_sockets)),
        }
    }

    /// The underlying `reqwest` client, for callers that need to build requests.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

impl Transport for PooledHttpTransport {
    type Request = Request;
    type Response = Response;
    type Error = AgentError;

    fn name_of(&self, request: &Request) -> String {
        endpoint_key(request.url())
    }

    fn url_of(&self, request: &Request) -> &Url {
        request.url()
    }

    fn approx_body_len(&self, request: &Request) -> u64 {
        request
            .body()
            .and_then(reqwest::Body::as_bytes)
            .map_or(0, |b| b.len() as u64)
    }

    fn view(&self) -> &dyn TransportView {
        self.pool.as_ref()
    }

    async fn submit(&self, name: &str, request: Request) -> Result<(u16, Response), AgentError> {
        let bytes = self.approx_body_len(&request);
        let lease = self.pool.acquire(name, bytes).await;

        match self.client.execute(request).await {
            Ok(response) => {
                let status = response.status().as_u16();
                lease.complete();
                Ok((status, response))
            }
            Err(err) => {
                lease.complete();
                Err(AgentError::from(err))
            }
        }
    }
}
