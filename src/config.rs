//! Delivery configuration.
//!
//! # Defaults
//!
//! | Setting              | Default                   | Environment              |
//! |----------------------|---------------------------|--------------------------|
//! | API key              | (required)                | `COURIER_API_KEY`        |
//! | Base URL             | `https://a.klaviyo.com`   | `COURIER_BASE_URL`       |
//! | Flush depth          | 25 requests               | `COURIER_FLUSH_DEPTH`    |
//! | Max retries          | 50                        | `COURIER_MAX_RETRIES`    |
//! | Debounce             | 100 ms                    | `COURIER_DEBOUNCE_MS`    |
//! | Flush intervals      | 10 s / 30 s / 60 s        |                          |
//! | Max retry interval   | 180 s                     |                          |
//! | Retry jitter         | 0..=10 s                  |                          |
//!
//! Flush intervals are per [`NetworkClass`]: unmetered, metered, offline.

use std::time::Duration;

use thiserror::Error;

use crate::host::NetworkClass;
use crate::types::ApiKey;

const DEFAULT_BASE_URL: &str = "https://a.klaviyo.com";
const DEFAULT_API_REVISION: &str = "2023-07-15";
const DEFAULT_DEBOUNCE_MS: u64 = 100;
const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 10;
const DEFAULT_FLUSH_DEPTH: usize = 25;
const DEFAULT_MAX_RETRIES: u32 = 50;
const DEFAULT_MAX_RETRY_INTERVAL_SECS: u64 = 180;
const DEFAULT_JITTER_SECS: u64 = 10;

/// Errors raised while building or validating a configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Flush interval for each network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushIntervals {
    pub unmetered: Duration,
    pub metered: Duration,
    pub offline: Duration,
}

impl FlushIntervals {
    pub const DEFAULT: Self = Self {
        unmetered: Duration::from_secs(10),
        metered: Duration::from_secs(30),
        offline: Duration::from_secs(60),
    };

    /// The same interval for every class.
    pub const fn uniform(interval: Duration) -> Self {
        Self {
            unmetered: interval,
            metered: interval,
            offline: interval,
        }
    }

    pub fn for_class(&self, class: NetworkClass) -> Duration {
        match class {
            NetworkClass::Unmetered => self.unmetered,
            NetworkClass::Metered => self.metered,
            NetworkClass::Offline => self.offline,
        }
    }
}

impl Default for FlushIntervals {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Values describing this device, reported with push token registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub platform: String,
    pub notifications_enabled: bool,
    pub background_available: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            platform: "rust".to_string(),
            notifications_enabled: true,
            background_available: true,
        }
    }
}

/// Everything the delivery engine needs to know up front.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Account the requests are attributed to.
    pub api_key: ApiKey,

    /// Collector origin, without a trailing slash.
    pub base_url: String,

    /// Value of the `Revision` header.
    pub api_revision: String,

    pub user_agent: String,

    /// Quiet period after the last profile mutation before it is sent.
    pub debounce_interval: Duration,

    /// Connect and read timeout for each HTTP call.
    pub network_timeout: Duration,

    pub flush_intervals: FlushIntervals,

    /// Queue depth that triggers a drain pass without waiting for the interval.
    pub flush_depth: usize,

    /// Rate-limited sends are retried while `attempts <= max_retries`.
    pub max_retries: u32,

    /// Upper bound on any retry interval.
    pub max_retry_interval: Duration,

    /// Upper bound of the uniform jitter added to retry intervals.
    pub jitter_max: Duration,

    pub device: DeviceInfo,
}

impl CourierConfig {
    /// Creates a configuration with default values for the given account.
    pub fn new(api_key: impl Into<ApiKey>) -> Self {
        CourierConfig {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_revision: DEFAULT_API_REVISION.to_string(),
            user_agent: format!("analytics-courier/{}", env!("CARGO_PKG_VERSION")),
            debounce_interval: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            network_timeout: Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS),
            flush_intervals: FlushIntervals::DEFAULT,
            flush_depth: DEFAULT_FLUSH_DEPTH,
            max_retries: DEFAULT_MAX_RETRIES,
            max_retry_interval: Duration::from_secs(DEFAULT_MAX_RETRY_INTERVAL_SECS),
            jitter_max: Duration::from_secs(DEFAULT_JITTER_SECS),
            device: DeviceInfo::default(),
        }
    }

    /// Creates a configuration from `COURIER_*` environment variables.
    ///
    /// `COURIER_API_KEY` is required; anything else unset falls back to the
    /// defaults. Set-but-unparseable numbers are reported, not ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup("COURIER_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::Missing("COURIER_API_KEY"))?;
        let mut config = Self::new(api_key);

        if let Some(url) = lookup("COURIER_BASE_URL") {
            config = config.with_base_url(url);
        }
        if let Some(depth) = parse_var(&lookup, "COURIER_FLUSH_DEPTH")? {
            config.flush_depth = depth;
        }
        if let Some(retries) = parse_var(&lookup, "COURIER_MAX_RETRIES")? {
            config.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "COURIER_DEBOUNCE_MS")? {
            config.debounce_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ConfigError::Missing("api_key"));
        }
        if self.flush_depth == 0 {
            return Err(ConfigError::Invalid {
                name: "flush_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                name: "max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: "base_url",
                reason: format!("{:?} is not an http(s) URL", self.base_url),
            });
        }
        Ok(())
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_debounce_interval(mut self, interval: Duration) -> Self {
        self.debounce_interval = interval;
        self
    }

    pub fn with_flush_intervals(mut self, intervals: FlushIntervals) -> Self {
        self.flush_intervals = intervals;
        self
    }

    pub fn with_flush_depth(mut self, depth: usize) -> Self {
        self.flush_depth = depth;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn with_jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.device = device;
        self
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self::new("")
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                name,
                reason: format!("{raw:?}: {e}"),
            }),
    }
}
