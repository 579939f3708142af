use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;

pub const DEFAULT_LEASE_WINDOW_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a claim may stay unacknowledged before the reaper releases it.
    pub lease_window_ms: u64,
    /// How often the reaper scans for expired claims. Defaults to the lease window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reap_interval_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            lease_window_ms: DEFAULT_LEASE_WINDOW_MS,
            reap_interval_ms: None,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }

    /// Loads a TOML config file, writing the defaults first if it does not exist.
    pub fn load_path<P: AsRef<Path>>(path: P) -> Result<QueueConfig, QueueError> {
        let cfg: QueueConfig = confy::load_path(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.lease_window_ms == 0 {
            return Err(QueueError::InvalidConfig(
                "lease_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.reap_interval_ms == Some(0) {
            return Err(QueueError::InvalidConfig(
                "reap_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn lease_window(&self) -> Duration {
        Duration::from_millis(self.lease_window_ms)
    }

    #[inline]
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.unwrap_or(self.lease_window_ms))
    }
}

#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    lease_window: Option<Duration>,
    reap_interval: Option<Duration>,
}

// Rounds up, so a non-zero duration never becomes zero milliseconds.
#[inline]
fn to_millis(d: Duration) -> u64 {
    let mut millis = d.as_millis();
    if d.subsec_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    u64::try_from(millis).unwrap_or(u64::MAX)
}

impl QueueConfigBuilder {
    pub fn lease_window(mut self, lease_window: Duration) -> Self {
        self.lease_window = Some(lease_window);
        self
    }

    pub fn reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = Some(reap_interval);
        self
    }

    pub fn build(self) -> Result<QueueConfig, QueueError> {
        let cfg = QueueConfig {
            lease_window_ms: self
                .lease_window
                .map(to_millis)
                .unwrap_or(DEFAULT_LEASE_WINDOW_MS),
            reap_interval_ms: self.reap_interval.map(to_millis),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
