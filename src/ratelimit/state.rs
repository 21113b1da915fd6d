//! Per-key algorithm state.
//!
//! Every bucket holds exactly one [`BucketState`] variant, matching the
//! strategy of the rule it was created under. Evaluation is a pure function of
//! the state, the rule and the current time, so callers only need to hold the
//! bucket's lock for the duration of [`BucketState::evaluate`].

use std::collections::VecDeque;

use super::rules::{RateLimitConfig, Strategy};
use super::status::RateLimitStatus;

/// Mutable state for one runtime key.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketState {
    /// Counter that restarts when the window expires
    FixedWindow { window_start: u64, request_count: u64 },
    /// Admitted request times inside the trailing window
    SlidingWindow { timestamps: VecDeque<u64> },
    /// Fractional token pool refilled on every check
    TokenBucket { tokens: f64, last_refill: u64 },
    /// Activity markers capped at `max_requests × 10`
    LeakyBucket { markers: VecDeque<u64> },
}

impl BucketState {
    /// The zero value for a rule's strategy.
    pub fn new(config: &RateLimitConfig, now: u64) -> Self {
        match config.strategy {
            Strategy::FixedWindow => BucketState::FixedWindow {
                window_start: now,
                request_count: 0,
            },
            Strategy::SlidingWindow => BucketState::SlidingWindow {
                timestamps: VecDeque::new(),
            },
            Strategy::TokenBucket => BucketState::TokenBucket {
                tokens: config.bucket_capacity() as f64,
                last_refill: now,
            },
            Strategy::LeakyBucket => BucketState::LeakyBucket {
                markers: VecDeque::new(),
            },
        }
    }

    /// The strategy this state belongs to.
    pub fn strategy(&self) -> Strategy {
        match self {
            BucketState::FixedWindow { .. } => Strategy::FixedWindow,
            BucketState::SlidingWindow { .. } => Strategy::SlidingWindow,
            BucketState::TokenBucket { .. } => Strategy::TokenBucket,
            BucketState::LeakyBucket { .. } => Strategy::LeakyBucket,
        }
    }

    /// Evaluate one request at time `now`, updating the state in place.
    pub fn evaluate(&mut self, config: &RateLimitConfig, now: u64) -> RateLimitStatus {
        if self.strategy() != config.strategy {
            *self = BucketState::new(config, now);
        }

        let window = config.window_size_ms;
        let max = config.max_requests;

        match self {
            BucketState::FixedWindow {
                window_start,
                request_count,
            } => {
                // Lazy rollover; two full windows can be admitted back to back
                // across a boundary.
                if now.saturating_sub(*window_start) > window {
                    *window_start = now;
                    *request_count = 0;
                }

                let allowed = *request_count < max;
                if allowed {
                    *request_count += 1;
                }

                let remaining = max.saturating_sub(*request_count);
                let reset_time = window_start.saturating_add(window);
                decide(allowed, remaining, reset_time, config)
            }

            BucketState::SlidingWindow { timestamps } => {
                let cutoff = now.saturating_sub(window);
                while matches!(timestamps.front(), Some(&t) if t < cutoff) {
                    timestamps.pop_front();
                }

                let allowed = (timestamps.len() as u64) < max;
                if allowed {
                    timestamps.push_back(now);
                }

                let remaining = max.saturating_sub(timestamps.len() as u64);
                let reset_time = timestamps.front().copied().unwrap_or(now).saturating_add(window);
                decide(allowed, remaining, reset_time, config)
            }

            BucketState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_sub(*last_refill) as f64;
                let refill = elapsed / window as f64 * max as f64;
                *tokens = (*tokens + refill).min(config.bucket_capacity() as f64);
                *last_refill = now;

                let allowed = *tokens >= 1.0;
                if allowed {
                    *tokens -= 1.0;
                }

                let remaining = tokens.floor() as u64;
                decide(allowed, remaining, now.saturating_add(window), config)
            }

            BucketState::LeakyBucket { markers } => {
                // Markers never drain on their own: this caps total recorded
                // activity rather than enforcing a leak rate.
                let cap = config.leaky_queue_cap();
                markers.push_back(now);

                let allowed = markers.len() as u64 <= cap;
                if !allowed {
                    markers.pop_front();
                }

                let remaining = cap.saturating_sub(markers.len() as u64);
                let reset_time = markers.front().copied().unwrap_or(now).saturating_add(window);
                decide(allowed, remaining, reset_time, config)
            }
        }
    }
}

fn decide(allowed: bool, remaining: u64, reset_time: u64, config: &RateLimitConfig) -> RateLimitStatus {
    if allowed {
        RateLimitStatus::allow(remaining, reset_time)
    } else {
        RateLimitStatus::deny(remaining, reset_time, config.penalty_ms)
    }
}
