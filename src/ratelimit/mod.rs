//! Rate limiting logic and state management.
//!
//! Four strategies are supported, selected per rule:
//!
//! | Strategy | Admits | Notes |
//! |----------|--------|-------|
//! | `fixed-window` | `max_requests` per window | up to 2× across a window boundary |
//! | `sliding-window` | `max_requests` in any trailing window | stores one timestamp per admitted request |
//! | `token-bucket` | bursts up to capacity, then `max_requests` per window | capacity is `burst` or `max_requests` |
//! | `leaky-bucket` | `max_requests × 10` markers in total | markers never drain; only bounds recorded activity |

mod key;
mod limiter;
mod metrics;
mod rules;
mod state;
mod status;

pub use key::RequestKey;
pub use limiter::{spawn_sweeper, RateLimiter, DEFAULT_IDLE_WINDOWS};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use rules::{RateLimitConfig, Strategy, DEFAULT_PENALTY_MS, LEAKY_QUEUE_FACTOR};
pub use state::BucketState;
pub use status::{RateLimitStatus, UNMETERED};
