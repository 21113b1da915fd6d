//! Throttle pacing rules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Pacing rules for one throttle key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Minimum spacing between call starts, in milliseconds
    #[serde(default, alias = "minIntervalMs")]
    pub min_interval_ms: u64,
    /// Cap on simultaneously running calls
    #[serde(default, alias = "maxConcurrent")]
    pub max_concurrent: Option<usize>,
    /// Queue depth above which a warning is logged; waiters are not rejected
    #[serde(default, alias = "queueSize")]
    pub queue_size: Option<usize>,
    /// Default deadline for getting admitted, in milliseconds
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

impl ThrottleConfig {
    /// Space calls at least `min_interval` apart.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval_ms: u64::try_from(min_interval.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Allow at most `max` calls in flight.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Warn once the wait queue grows past `size`.
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = Some(size);
        self
    }

    /// Fail callers not admitted within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == Some(0) {
            return Err(GatekeeperError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(GatekeeperError::Config(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_throttle() {
        let yaml = r#"
min_interval_ms: 200
max_concurrent: 2
queue_size: 16
"#;
        let config: ThrottleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.min_interval(), Duration::from_millis(200));
        assert_eq!(config.max_concurrent, Some(2));
        assert_eq!(config.queue_size, Some(16));
        assert!(config.timeout().is_none());
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let yaml = r#"
minIntervalMs: 50
maxConcurrent: 4
timeoutMs: 3000
"#;
        let config: ThrottleConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.min_interval_ms, 50);
        assert_eq!(config.timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = ThrottleConfig::default().with_max_concurrent(0);
        assert!(matches!(config.validate(), Err(GatekeeperError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ThrottleConfig::default().with_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
