//! Rate limit rule definitions.
//!
//! A rule names a limiting strategy and its parameters. Rules are registered
//! under a config name and never change strategy without an explicit
//! re-registration, which also resets every bucket under that name.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Penalty applied to denials when a rule does not set one.
pub const DEFAULT_PENALTY_MS: u64 = 1000;

/// Leaky buckets hold this many markers per unit of `max_requests`.
pub const LEAKY_QUEUE_FACTOR: u64 = 10;

/// The limiting algorithm applied to a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Strategy {
    /// The configuration name of this strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed-window",
            Strategy::SlidingWindow => "sliding-window",
            Strategy::TokenBucket => "token-bucket",
            Strategy::LeakyBucket => "leaky-bucket",
        }
    }
}

impl FromStr for Strategy {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fixed-window" => Ok(Strategy::FixedWindow),
            "sliding-window" => Ok(Strategy::SlidingWindow),
            "token-bucket" => Ok(Strategy::TokenBucket),
            "leaky-bucket" => Ok(Strategy::LeakyBucket),
            other => Err(GatekeeperError::Config(format!(
                "unknown rate limit strategy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one named rate limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Which algorithm evaluates requests
    pub strategy: Strategy,
    /// Time base of the algorithm, in milliseconds
    #[serde(alias = "windowSize")]
    pub window_size_ms: u64,
    /// Capacity; its exact meaning depends on the strategy
    #[serde(alias = "maxRequests")]
    pub max_requests: u64,
    /// Token bucket capacity, when larger than the steady rate
    #[serde(default)]
    pub burst: Option<u64>,
    /// How long a denied caller should wait before retrying
    #[serde(default = "default_penalty_ms", alias = "penalty")]
    pub penalty_ms: u64,
}

fn default_penalty_ms() -> u64 {
    DEFAULT_PENALTY_MS
}

impl RateLimitConfig {
    /// Create a rule with the default penalty and no burst override.
    pub fn new(strategy: Strategy, window: Duration, max_requests: u64) -> Self {
        Self {
            strategy,
            window_size_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_requests,
            burst: None,
            penalty_ms: DEFAULT_PENALTY_MS,
        }
    }

    /// Build a rule from a strategy name, failing on names we don't know.
    pub fn parse(strategy: &str, window_size_ms: u64, max_requests: u64) -> Result<Self> {
        let config = Self {
            strategy: strategy.parse()?,
            window_size_ms,
            max_requests,
            burst: None,
            penalty_ms: DEFAULT_PENALTY_MS,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the token bucket burst capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Set the denial penalty.
    pub fn with_penalty(mut self, penalty: Duration) -> Self {
        self.penalty_ms = u64::try_from(penalty.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.window_size_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "{} rule needs a window_size_ms greater than zero",
                self.strategy
            )));
        }
        Ok(())
    }

    /// Token bucket capacity: `burst` if set, otherwise `max_requests`.
    pub fn bucket_capacity(&self) -> u64 {
        self.burst.unwrap_or(self.max_requests)
    }

    /// Maximum number of markers a leaky bucket retains.
    pub fn leaky_queue_cap(&self) -> u64 {
        self.max_requests.saturating_mul(LEAKY_QUEUE_FACTOR)
    }

    /// The window as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy_names() {
        assert_eq!("fixed-window".parse::<Strategy>().unwrap(), Strategy::FixedWindow);
        assert_eq!("sliding-window".parse::<Strategy>().unwrap(), Strategy::SlidingWindow);
        assert_eq!("token-bucket".parse::<Strategy>().unwrap(), Strategy::TokenBucket);
        assert_eq!("leaky-bucket".parse::<Strategy>().unwrap(), Strategy::LeakyBucket);
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let err = "gcra".parse::<Strategy>().unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));

        let err = RateLimitConfig::parse("round-robin", 1000, 10).unwrap_err();
        assert!(err.to_string().contains("round-robin"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = RateLimitConfig::parse("fixed-window", 0, 10).unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));
    }

    #[test]
    fn test_parse_yaml_rule() {
        let yaml = r#"
strategy: token-bucket
window_size_ms: 1000
max_requests: 5
burst: 20
"#;
        let rule: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.strategy, Strategy::TokenBucket);
        assert_eq!(rule.bucket_capacity(), 20);
        assert_eq!(rule.penalty_ms, DEFAULT_PENALTY_MS);
    }

    #[test]
    fn test_parse_camel_case_aliases() {
        let yaml = r#"
strategy: leaky-bucket
windowSize: 60000
maxRequests: 3
penalty: 2500
"#;
        let rule: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule.window(), Duration::from_secs(60));
        assert_eq!(rule.leaky_queue_cap(), 30);
        assert_eq!(rule.penalty_ms, 2500);
    }

    #[test]
    fn test_unknown_strategy_in_yaml_fails() {
        let yaml = r#"
strategy: random-drop
window_size_ms: 1000
max_requests: 5
"#;
        assert!(serde_yaml::from_str::<RateLimitConfig>(yaml).is_err());
    }

    #[test]
    fn test_capacity_defaults_to_max_requests() {
        let rule = RateLimitConfig::new(Strategy::TokenBucket, Duration::from_secs(1), 7);
        assert_eq!(rule.bucket_capacity(), 7);
        assert_eq!(rule.with_burst(9).bucket_capacity(), 9);
    }
}
