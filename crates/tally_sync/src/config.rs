//! Configuration for the sync connector.

use rand::Rng;
use std::time::Duration;

/// Configuration for the connector and its background worker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the local Tally instance, e.g. `http://localhost:9000`.
    pub tally_url: String,
    /// Timeout for report export requests.
    pub request_timeout: Duration,
    /// Timeout for the liveness probe.
    pub probe_timeout: Duration,
    /// Interval between timer-driven sync cycles.
    pub poll_interval: Duration,
    /// Retry behavior after transient failures.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration for the given Tally URL.
    pub fn new(tally_url: impl Into<String>) -> Self {
        Self {
            tally_url: tally_url.into(),
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the report request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the liveness probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the interval between timer-driven cycles.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("http://localhost:9000")
    }
}

/// Exponential backoff with full jitter.
///
/// The delay after the n-th consecutive failure (0-indexed) is a uniform
/// sample from `(0, min(base * 2^n, max)]`. With jitter disabled the
/// capped exponential delay is returned exactly, which is what the
/// backoff tests pin down.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure, before doubling.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Whether to apply full jitter.
    pub full_jitter: bool,
}

impl RetryConfig {
    /// Creates the default policy: base 2s, cap 60s, full jitter.
    pub fn new() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            full_jitter: true,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter, making delays deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.full_jitter = false;
        self
    }

    /// The capped exponential delay for a given failure count, before
    /// jitter. Attempt 0 is the first failure.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(31) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }

    /// Computes the delay before the next attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if self.full_jitter {
            let fraction: f64 = rand::thread_rng().gen_range(0.0..=1.0);
            capped.mul_f64(fraction)
        } else {
            capped
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}
