//! Agent configuration.
//!
//! Follows the builder shape `mcpkit-transport`'s `PoolConfig` and `RateLimitConfig`
//! use: a plain struct with `#[must_use] pub const fn` chain methods where the field is
//! a plain value, and ordinary (non-`const`) chain methods where the field is a boxed
//! closure or trait object (§6's pluggable `getRate`/`getFlag`/`getRateDirection`).

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::feedback::{DefaultRateDirection, RateDirection};
use crate::limiter::MAX_RATE;

/// A per-endpoint target-rate function (§6 `getRate(name, flag)`).
pub type GetRate = Arc<dyn Fn(&str, &str) -> u64 + Send + Sync>;
/// A URL-to-flag function (§6 `getFlag(url)`).
pub type GetFlag = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// Configuration for a [`crate::agent::ThrottleAgent`] (§6 "Configuration").
#[derive(Clone)]
#[non_exhaustive]
pub struct AgentConfig {
    /// Default target rate per interval, used unless `get_rate` is overridden.
    pub rate: u64,
    /// Accounting window size (§3 `interval`).
    pub rate_interval: Duration,
    /// Multiplier on `failed` when computing `diff` (§4.4).
    pub rate_lower_weight: u64,
    /// Fractional step for a rate decrease (§4.4; §9 open question 1 resolves the
    /// source/README discrepancy — see `DESIGN.md`).
    pub rate_lower_koef: f64,
    /// Fractional step for a rate increase (§4.4).
    pub rate_raise_koef: f64,
    /// Per-endpoint pending-queue cutoff (§4.3 rule 1).
    pub max_pending: usize,
    /// Per-socket average buffer cutoff in bytes (§4.3 rule 2).
    pub max_buffer: u64,
    /// Enable the `canAcceptRequest` pre-check path (§4.3).
    pub check_before_request: bool,
    /// Per-endpoint target-rate function. `None` means "use `rate` for every
    /// endpoint" (§6: "`getRate(name, flag)` | returns agent's `rate`"); installing
    /// one via [`AgentConfig::get_rate`] overrides that fallback.
    pub get_rate: Option<GetRate>,
    /// URL-to-flag function; defaults to always returning `""`.
    pub get_flag: GetFlag,
    /// Outcome classifier (§4.4); defaults to [`DefaultRateDirection`].
    pub rate_direction: Box<dyn RateDirection>,
}

impl AgentConfig {
    /// Default target rate per interval (§6).
    pub const DEFAULT_RATE: u64 = MAX_RATE;
    /// Default accounting window (§6).
    pub const DEFAULT_RATE_INTERVAL: Duration = Duration::from_millis(1000);
    /// Default weight applied to `failed` in the sign test (§6).
    pub const DEFAULT_RATE_LOWER_WEIGHT: u64 = 18;
    /// Default decrease coefficient. The source constants table uses `0.2`; its README
    /// documents `0.1` (§9 open question 1). This crate follows the source constants,
    /// which is the behavior actually exercised at runtime — see `DESIGN.md`.
    pub const DEFAULT_RATE_LOWER_KOEF: f64 = 0.2;
    /// Default increase coefficient (§6).
    pub const DEFAULT_RATE_RAISE_KOEF: f64 = 0.02;
    /// Default pending-queue cutoff (§6).
    pub const DEFAULT_MAX_PENDING: usize = 3000;
    /// Default average-buffer cutoff in bytes (§6).
    pub const DEFAULT_MAX_BUFFER: u64 = 50;

    /// Build a config with every default from §6's configuration table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the default target rate (§6 `rate`). Every per-endpoint lookup goes
    /// through [`AgentConfig::resolve_rate`], which falls back to this field whenever
    /// no custom [`AgentConfig::get_rate`] function has been installed — so this alone
    /// is enough to change the rate the agent targets.
    #[must_use]
    pub const fn rate(mut self, rate: u64) -> Self {
        self.rate = rate;
        self
    }

    /// Override the accounting window (§6 `rateInterval`).
    #[must_use]
    pub const fn rate_interval(mut self, interval: Duration) -> Self {
        self.rate_interval = interval;
        self
    }

    /// Override the failure weight (§6 `rateLowerWeight`).
    #[must_use]
    pub const fn rate_lower_weight(mut self, weight: u64) -> Self {
        self.rate_lower_weight = weight;
        self
    }

    /// Override the decrease coefficient (§6 `rateLowerKoef`).
    #[must_use]
    pub const fn rate_lower_koef(mut self, koef: f64) -> Self {
        self.rate_lower_koef = koef;
        self
    }

    /// Override the increase coefficient (§6 `rateRaiseKoef`).
    #[must_use]
    pub const fn rate_raise_koef(mut self, koef: f64) -> Self {
        self.rate_raise_koef = koef;
        self
    }

    /// Override the pending-queue cutoff (§6 `maxPending`).
    #[must_use]
    pub const fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Override the average-buffer cutoff (§6 `maxBuffer`).
    #[must_use]
    pub const fn max_buffer(mut self, max_buffer: u64) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Enable the pre-check path (§6 `checkBeforeRequest`).
    #[must_use]
    pub const fn check_before_request(mut self, enabled: bool) -> Self {
        self.check_before_request = enabled;
        self
    }

    /// Install a per-endpoint target-rate function (§6 `getRate`), overriding the
    /// `rate`-based fallback for every endpoint.
    #[must_use]
    pub fn get_rate<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> u64 + Send + Sync + 'static,
    {
        self.get_rate = Some(Arc::new(f));
        self
    }

    /// Resolve the target rate for `(name, flag)` (§6 `getRate(name, flag)`): the
    /// installed [`AgentConfig::get_rate`] function if one was set, else `self.rate`.
    #[must_use]
    pub fn resolve_rate(&self, name: &str, flag: &str) -> u64 {
        self.get_rate
            .as_ref()
            .map_or(self.rate, |f| f(name, flag))
    }

    /// Install a URL-to-flag function (§6 `getFlag`).
    #[must_use]
    pub fn get_flag<F>(mut self, f: F) -> Self
    where
        F: Fn(&Url) -> String + Send + Sync + 'static,
    {
        self.get_flag = Arc::new(f);
        self
    }

    /// Install a custom outcome classifier (§6 `getRateDirection`).
    #[must_use]
    pub fn rate_direction<D: RateDirection + 'static>(mut self, direction: D) -> Self {
        self.rate_direction = Box::new(direction);
        self
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rate: Self::DEFAULT_RATE,
            rate_interval: Self::DEFAULT_RATE_INTERVAL,
            rate_lower_weight: Self::DEFAULT_RATE_LOWER_WEIGHT,
            rate_lower_koef: Self::DEFAULT_RATE_LOWER_KOEF,
            rate_raise_koef: Self::DEFAULT_RATE_RAISE_KOEF,
            max_pending: Self::DEFAULT_MAX_PENDING,
            max_buffer: Self::DEFAULT_MAX_BUFFER,
            check_before_request: false,
            get_rate: None,
            get_flag: Arc::new(|_url| String::new()),
            rate_direction: Box::new(DefaultRateDirection),
        }
    }
}
