//! The process-wide admission controller.
//!
//! Build one [`Gatekeeper`] at startup and hand clones of it (or of its
//! `Arc`ed parts) to whatever needs admission control.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::GatekeeperConfig;
use crate::error::Result;
use crate::ratelimit::{spawn_sweeper, RateLimiter};
use crate::throttle::Throttler;

/// A rate limiter and a throttler configured together.
#[derive(Clone)]
pub struct Gatekeeper {
    limiter: Arc<RateLimiter>,
    throttler: Arc<Throttler>,
    sweep_interval: Duration,
}

impl Gatekeeper {
    /// Build from configuration on the system clock.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// Build from configuration, reading rate limit time from `clock`.
    pub fn from_config_with_clock(config: &GatekeeperConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let limiter = RateLimiter::with_clock(clock).with_idle_windows(config.eviction.idle_windows);
        for (name, rule) in &config.rate_limits {
            limiter.set_config(name, rule.clone())?;
        }

        let throttler = Throttler::new();
        for (key, rule) in &config.throttles {
            throttler.set_config(key, rule.clone())?;
        }

        info!(
            rate_limits = config.rate_limits.len(),
            throttles = config.throttles.len(),
            "Gatekeeper initialized"
        );

        Ok(Self {
            limiter: Arc::new(limiter),
            throttler: Arc::new(throttler),
            sweep_interval: Duration::from_secs(config.eviction.sweep_interval_secs),
        })
    }

    /// The shared rate limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// The shared throttler.
    pub fn throttler(&self) -> &Arc<Throttler> {
        &self.throttler
    }

    /// Start the idle bucket sweeper on the current tokio runtime.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        info!(interval_secs = self.sweep_interval.as_secs(), "Starting idle bucket sweeper");
        spawn_sweeper(Arc::clone(&self.limiter), self.sweep_interval)
    }
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new()),
            throttler: Arc::new(Throttler::new()),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
