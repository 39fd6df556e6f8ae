//! Flush and retry intervals.
//!
//! The base interval depends on the network class. After a rate-limited
//! send the next pass waits
//!
//! ```text
//! min(max_interval, max(base, base × attempts) + jitter)
//! ```
//!
//! so growth is linear in the attempt count, not doubling. A numeric
//! `Retry-After` response header replaces the computed part. Any success
//! resets the interval to the base.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::{CourierConfig, FlushIntervals};
use crate::host::NetworkClass;
use crate::request::ApiRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    intervals: FlushIntervals,
    max_interval: Duration,
    jitter_max: Duration,
}

impl Backoff {
    pub fn new(intervals: FlushIntervals, max_interval: Duration, jitter_max: Duration) -> Self {
        Backoff {
            intervals,
            max_interval,
            jitter_max,
        }
    }

    pub fn from_config(config: &CourierConfig) -> Self {
        Self::new(
            config.flush_intervals,
            config.max_retry_interval,
            config.jitter_max,
        )
    }

    /// The un-retried flush interval for `class`.
    pub fn base_interval(&self, class: NetworkClass) -> Duration {
        self.intervals.for_class(class)
    }

    /// Deterministic part of the retry interval: `base × attempts`, at least
    /// `base`, capped at the maximum.
    pub fn delay_for_attempts(&self, class: NetworkClass, attempts: u32) -> Duration {
        self.base_interval(class)
            .saturating_mul(attempts.max(1))
            .min(self.max_interval)
    }

    /// Uniform random jitter in `0..=jitter_max`.
    pub fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.jitter_max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Interval before retrying `request`, which just came back rate limited.
    pub fn retry_interval(&self, request: &ApiRequest, class: NetworkClass) -> Duration {
        let delay = match request.retry_after() {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!(
                        request_id = %request.id,
                        retry_after = raw,
                        "Unparseable Retry-After header, using computed backoff"
                    );
                    self.delay_for_attempts(class, request.attempts)
                }
            },
            None => self.delay_for_attempts(class, request.attempts),
        };
        delay.saturating_add(self.jitter()).min(self.max_interval)
    }
}
