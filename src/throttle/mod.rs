//! Cooperative throttling of outbound calls.
//!
//! A [`Throttler`] wraps arbitrary async operations so that, per key, call
//! starts are spaced at least `min_interval_ms` apart and no more than
//! `max_concurrent` calls run at once. Callers over the concurrency cap wait
//! in arrival order; every wait can be bounded by a deadline.

mod rules;
mod throttler;

pub use rules::ThrottleConfig;
pub use throttler::{ThrottleStatus, Throttler};
