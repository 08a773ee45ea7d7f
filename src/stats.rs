//! `getStats()` snapshot types (§6 "Exposed agent interface").
//!
//! Shaped after `mcpkit-transport`'s `PoolStats` (`pool/config.rs`): a plain,
//! `#[non_exhaustive]` data struct with public fields, no behavior.

/// One endpoint's snapshot, keyed in [`crate::agent::ThrottleAgent::get_stats`]'s map by
/// its label (the flag if non-empty, else the name).
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct EndpointStats {
    /// Tokens accepted so far in the current interval.
    pub accepted: u64,
    /// Tokens requested (accepted + rejected) so far in the current interval.
    pub incoming: u64,
    /// Current working limit (§6: "reports the current *working* `limit`, not the
    /// target").
    pub rate: u64,
    /// Smoothed average observed request duration, in milliseconds.
    pub average_time_ms: f64,
    /// Number of sockets currently open (in use) for this endpoint.
    pub used: usize,
    /// Number of idle, pooled sockets immediately reusable for this endpoint.
    pub free: usize,
    /// Number of requests queued waiting for a socket.
    pub pending: usize,
    /// Approximate average buffer occupancy (bytes) across open sockets.
    pub buffer_size: u64,
}
