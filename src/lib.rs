//! Gatekeeper - In-process Admission Control
//!
//! This crate decides whether requests may proceed and paces the ones that do.
//! A [`RateLimiter`](ratelimit::RateLimiter) gives hard allow/deny decisions
//! under one of four strategies per rule; a [`Throttler`](throttle::Throttler)
//! spaces out and concurrency-limits async calls to rate-limited upstreams.
//! Both keep all state in memory, per process.

pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod ratelimit;
pub mod throttle;

pub use error::{GatekeeperError, Result, ThrottleError};
pub use gatekeeper::Gatekeeper;
