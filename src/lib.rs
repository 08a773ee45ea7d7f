//! Adaptive, per-endpoint admission control for an HTTP client connection pool.
//!
//! [`ThrottleAgent`] wraps an underlying HTTP transport (see [`transport::Transport`])
//! and throttles outbound requests on a per-destination basis, raising or lowering each
//! endpoint's permitted rate in closed-loop response to observed server behavior
//! (status codes, transport errors, timeouts) and local transport health (open socket
//! counts, pending queue depth, socket buffer occupancy). It does not itself manage TCP
//! connections, TLS, or keep-alive — that is the wrapped transport's job.
//!
//! ```no_run
//! use throttle_agent::{AgentConfig, PooledHttpTransport, ThrottleAgent};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = PooledHttpTransport::new(reqwest::Client::new(), 50);
//! let agent = ThrottleAgent::new(transport, AgentConfig::new().rate(100));
//!
//! let request = agent
//!     .transport()
//!     .client()
//!     .get("https://example.com")
//!     .build()?;
//! let response = agent.submit(request, None).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod agent;
pub mod config;
pub mod error;
pub mod feedback;
pub mod limiter;
pub mod pool;
pub mod registry;
pub mod stats;
pub mod transport;

pub use agent::{StatEvent, ThrottleAgent};
pub use config::AgentConfig;
pub use error::{AgentError, AgentErrorKind};
pub use feedback::{DefaultRateDirection, Direction, Outcome, RateDirection};
pub use limiter::{Limiter, LimiterStat};
pub use pool::{SocketLease, SocketPool};
pub use stats::EndpointStats;
pub use transport::{PooledHttpTransport, Transport, TransportView};
