use crate::{Error, Result};
use std::time::Duration;

/// Scheduler settings shared by every tracker started with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How often the scheduler wakes up to attempt a cycle. Independent of the
    /// image's `min_time_to_update`, which throttles the attempts themselves.
    pub tick_interval: Duration,
    /// Upper bound for any single producer call. Nodes may override it.
    /// `None` lets a hanging producer block its tracker indefinitely.
    pub producer_timeout: Option<Duration>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1_000),
            producer_timeout: None,
        }
    }
}

impl TrackerConfig {
    /// Read overrides from `TRACKER_TICK_INTERVAL_MS` and
    /// `TRACKER_PRODUCER_TIMEOUT_MS`; unset variables keep the defaults.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(ms) = env_millis("TRACKER_TICK_INTERVAL_MS")? {
            cfg.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_millis("TRACKER_PRODUCER_TIMEOUT_MS")? {
            cfg.producer_timeout = Some(Duration::from_millis(ms));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_producer_timeout(mut self, timeout: Duration) -> Self {
        self.producer_timeout = Some(timeout);
        self
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            return Err(Error::configuration("tick_interval must be > 0"));
        }
        if self.producer_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::configuration("producer_timeout must be > 0"));
        }
        Ok(())
    }
}

fn env_millis(key: &str) -> Result<Option<u64>> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::configuration(format!("{key} must be an integer (got {raw:?})")))
}
