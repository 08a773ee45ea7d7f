//! Agent error types.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification of an [`AgentError`], for callers that want to branch on
/// category without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    /// Rejected by admission control before the request reached the transport.
    Rejected,
    /// The underlying transport reported a failure.
    Transport,
    /// The agent's own armed timeout fired.
    Timeout,
    /// An internal invariant was violated; not expected to be recoverable.
    Internal,
}

/// Errors surfaced by the throttle agent.
///
/// Admission rejections and agent-armed timeouts are synthesized by the agent itself;
/// transport errors are propagated unchanged from the underlying HTTP client (see
/// "Propagation policy" in the design notes — the agent never swallows transport
/// errors).
#[derive(Error, Debug)]
pub enum AgentError {
    /// Request was rejected by admission control. Carries the same shape a caller would
    /// see from a real `429 Too Many Requests` response.
    #[error("429 Too Many Requests")]
    Rejected {
        /// Always 429; kept as a field (rather than hardcoded in Display) so callers
        /// can match on it the same way they'd match a status code from the transport.
        status: u16,
    },

    /// The underlying HTTP transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The agent's own timer fired before the request completed.
    #[error("request timed out after {after:?}")]
    Timeout {
        /// How long the agent waited before aborting.
        after: Duration,
    },

    /// A registry or limiter invariant was violated. Treat as a programming error.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl AgentError {
    /// Construct the synthetic admission-rejection error (§6: "429 Too Many Requests").
    #[must_use]
    pub const fn rejected() -> Self {
        Self::Rejected { status: 429 }
    }

    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> AgentErrorKind {
        match self {
            Self::Rejected { .. } => AgentErrorKind::Rejected,
            Self::Transport(_) => AgentErrorKind::Transport,
            Self::Timeout { .. } => AgentErrorKind::Timeout,
            Self::Internal(_) => AgentErrorKind::Internal,
        }
    }

    /// The string error code the feedback engine classifies on (§4.4), mirroring
    /// Node-style `err.code` strings such as `"ETIMEDOUT"` for transport failures that
    /// don't carry an HTTP status.
    #[must_use]
    pub fn feedback_code(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } => Some("ETIMEDOUT"),
            Self::Transport(e) if e.is_connect() => Some("ECONNRESET"),
            Self::Transport(_) => Some("EHTTPERROR"),
            Self::Rejected { .. } | Self::Internal(_) => None,
        }
    }
}
