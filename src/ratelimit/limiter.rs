//! Core rate limiter implementation.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::key::RequestKey;
use super::metrics::{MetricsRecorder, MetricsSnapshot};
use super::rules::RateLimitConfig;
use super::state::BucketState;
use super::status::RateLimitStatus;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Idle windows after which a bucket is dropped, unless overridden.
pub const DEFAULT_IDLE_WINDOWS: u64 = 10;

/// Algorithm state for one runtime key, plus when it was last used.
#[derive(Debug)]
struct Bucket {
    state: BucketState,
    last_seen: u64,
    /// Set under the lock when the sweeper drops this bucket from its map
    evicted: bool,
}

/// A registered rule and the buckets created under it.
struct LimitEntry {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
}

impl LimitEntry {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }
}

/// The rate limiter that owns rules, per-key buckets and metrics.
///
/// Each bucket sits behind its own lock, so checks on unrelated keys never
/// contend. Share it across tasks and threads with an `Arc`.
pub struct RateLimiter {
    /// Rules indexed by name
    limits: DashMap<String, Arc<LimitEntry>>,
    /// Metrics indexed by rule name
    metrics: DashMap<String, Arc<MetricsRecorder>>,
    clock: Arc<dyn Clock>,
    idle_windows: u64,
}

impl RateLimiter {
    /// Create a rate limiter on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a rate limiter that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            limits: DashMap::new(),
            metrics: DashMap::new(),
            clock,
            idle_windows: DEFAULT_IDLE_WINDOWS,
        }
    }

    /// Set how many idle windows a bucket survives before eviction.
    pub fn with_idle_windows(mut self, idle_windows: u64) -> Self {
        self.idle_windows = idle_windows.max(1);
        self
    }

    /// Register or replace the rule for `name`.
    ///
    /// Every bucket under the name starts over from its zero value. Rules that
    /// fail validation are rejected and the previous rule stays in place.
    pub fn set_config(&self, name: &str, config: RateLimitConfig) -> Result<()> {
        config.validate()?;

        info!(
            name = %name,
            strategy = %config.strategy,
            window_ms = config.window_size_ms,
            max_requests = config.max_requests,
            "Registering rate limit"
        );

        self.limits
            .insert(name.to_string(), Arc::new(LimitEntry::new(config)));
        Ok(())
    }

    /// Get the rule registered for `name`.
    pub fn get_config(&self, name: &str) -> Option<RateLimitConfig> {
        self.limits.get(name).map(|entry| entry.config.clone())
    }

    /// Remove the rule for `name`; later checks are unmetered.
    pub fn remove_config(&self, name: &str) -> Option<RateLimitConfig> {
        let (_, entry) = self.limits.remove(name)?;
        info!(name = %name, "Removed rate limit");
        Some(entry.config.clone())
    }

    /// Check a request from `client_id` against `endpoint` under rule `name`.
    pub fn check_request(&self, name: &str, client_id: &str, endpoint: &str) -> RateLimitStatus {
        let key = RequestKey::new(client_id, endpoint);
        self.check_limit(name, &key.to_string_key())
    }

    /// Check one request for runtime `key` under rule `name`.
    ///
    /// Names with no registered rule are always allowed with
    /// `remaining = -1`. Never blocks beyond the bucket's own lock.
    pub fn check_limit(&self, name: &str, key: &str) -> RateLimitStatus {
        let started = Instant::now();
        let now = self.clock.now_millis();

        // Clone the Arc out so no map guard is held while the bucket is locked.
        let entry = self.limits.get(name).map(|e| Arc::clone(e.value()));

        let status = match entry {
            None => {
                trace!(name = %name, key = %key, "No rate limit configured");
                RateLimitStatus::unmetered(now)
            }
            Some(entry) => {
                let status = loop {
                    let bucket = Self::bucket(&entry, name, key, now);
                    if let Some(status) = Self::evaluate_in(&entry, &bucket, now) {
                        break status;
                    }
                    trace!(name = %name, key = %key, "Bucket evicted during check, retrying");
                };

                trace!(
                    name = %name,
                    key = %key,
                    allowed = status.allowed,
                    remaining = status.remaining,
                    "Checked rate limit"
                );
                if !status.allowed {
                    debug!(
                        name = %name,
                        key = %key,
                        retry_after_ms = ?status.retry_after,
                        "Rate limit exceeded"
                    );
                }
                status
            }
        };

        self.recorder(name).record(status.allowed, started.elapsed());
        status
    }

    /// Metrics for rule `name`, or `None` before the first check.
    pub fn get_metrics(&self, name: &str) -> Option<MetricsSnapshot> {
        self.metrics.get(name).and_then(|m| m.snapshot())
    }

    /// Return every bucket under `name` to its zero value.
    ///
    /// Recorded metrics are kept.
    pub fn reset(&self, name: &str) {
        let entry = self.limits.get(name).map(|e| Arc::clone(e.value()));
        if let Some(entry) = entry {
            entry.buckets.clear();
            debug!(name = %name, "Reset rate limit state");
        }
    }

    /// Number of live buckets under `name`.
    pub fn bucket_count(&self, name: &str) -> usize {
        self.limits
            .get(name)
            .map(|entry| entry.buckets.len())
            .unwrap_or(0)
    }

    /// Drop buckets untouched for `idle_windows` windows of their rule.
    ///
    /// Buckets locked by an in-progress check are kept. Metrics for names
    /// that have no registered rule are dropped too. Returns how many
    /// buckets were removed.
    pub fn evict_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let entries: Vec<Arc<LimitEntry>> =
            self.limits.iter().map(|e| Arc::clone(e.value())).collect();

        let mut evicted = 0;
        for entry in entries {
            let ttl = entry.config.window_size_ms.saturating_mul(self.idle_windows);
            let before = entry.buckets.len();
            entry.buckets.retain(|_, bucket| match bucket.try_lock() {
                Some(mut bucket) => {
                    let keep = now.saturating_sub(bucket.last_seen) < ttl;
                    bucket.evicted = !keep;
                    keep
                }
                None => true,
            });
            evicted += before.saturating_sub(entry.buckets.len());
        }

        // Recorders for names with no rule (never configured, or removed)
        // would otherwise accumulate forever.
        let configured: HashSet<String> = self.limits.iter().map(|e| e.key().clone()).collect();
        self.metrics.retain(|name, _| configured.contains(name));

        if evicted > 0 {
            debug!(evicted = evicted, "Evicted idle rate limit buckets");
        }
        evicted
    }

    /// Get or create the bucket for `key` under `entry`.
    fn bucket(entry: &LimitEntry, name: &str, key: &str, now: u64) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = entry.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        entry
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(
                    name = %name,
                    key = %key,
                    strategy = %entry.config.strategy,
                    "Creating new rate limit bucket"
                );
                Arc::new(Mutex::new(Bucket {
                    state: BucketState::new(&entry.config, now),
                    last_seen: now,
                    evicted: false,
                }))
            })
            .clone()
    }

    /// Evaluate one request against `bucket`, or `None` if the sweeper
    /// removed it after it was looked up.
    fn evaluate_in(entry: &LimitEntry, bucket: &Mutex<Bucket>, now: u64) -> Option<RateLimitStatus> {
        let mut bucket = bucket.lock();
        if bucket.evicted {
            return None;
        }
        bucket.last_seen = now;
        Some(bucket.state.evaluate(&entry.config, now))
    }

    fn recorder(&self, name: &str) -> Arc<MetricsRecorder> {
        if let Some(recorder) = self.metrics.get(name) {
            return Arc::clone(recorder.value());
        }
        self.metrics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MetricsRecorder::new()))
            .clone()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Run [`RateLimiter::evict_idle`] every `every` until the task is aborted.
pub fn spawn_sweeper(limiter: Arc<RateLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.evict_idle();
        }
    })
}
