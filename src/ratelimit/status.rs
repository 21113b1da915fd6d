//! Admission decisions returned to callers.

use serde::Serialize;

/// `remaining` value reported for names with no registered rule.
pub const UNMETERED: i64 = -1;

/// The outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Quota left after this request, or [`UNMETERED`]
    pub remaining: i64,
    /// When the quota resets, in epoch milliseconds
    pub reset_time: u64,
    /// Milliseconds to wait before retrying; only set on denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitStatus {
    pub(crate) fn allow(remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining: clamp_remaining(remaining),
            reset_time,
            retry_after: None,
        }
    }

    pub(crate) fn deny(remaining: u64, reset_time: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            remaining: clamp_remaining(remaining),
            reset_time,
            retry_after: Some(retry_after),
        }
    }

    pub(crate) fn unmetered(now: u64) -> Self {
        Self {
            allowed: true,
            remaining: UNMETERED,
            reset_time: now,
            retry_after: None,
        }
    }

    /// True when no rule applied to the request.
    pub fn is_unmetered(&self) -> bool {
        self.remaining == UNMETERED
    }

    /// Response headers an HTTP layer should attach.
    ///
    /// `X-RateLimit-Reset` is epoch seconds and `Retry-After` is whole
    /// seconds rounded up. Unmetered decisions produce no headers.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        if self.is_unmetered() {
            return Vec::new();
        }

        let mut headers = vec![
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", (self.reset_time / 1000).to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            headers.push(("Retry-After", retry_after.div_ceil(1000).to_string()));
        }
        headers
    }
}

fn clamp_remaining(remaining: u64) -> i64 {
    i64::try_from(remaining).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmetered_status() {
        let status = RateLimitStatus::unmetered(5_000);
        assert!(status.allowed);
        assert!(status.is_unmetered());
        assert_eq!(status.remaining, -1);
        assert!(status.headers().is_empty());
    }

    #[test]
    fn test_denied_headers_round_retry_after_up() {
        let status = RateLimitStatus::deny(0, 61_000, 1_500);
        let headers = status.headers();

        assert_eq!(headers.len(), 3);
        assert_eq!(headers[0], ("X-RateLimit-Remaining", "0".to_string()));
        assert_eq!(headers[1], ("X-RateLimit-Reset", "61".to_string()));
        assert_eq!(headers[2], ("Retry-After", "2".to_string()));
    }

    #[test]
    fn test_allowed_status_serializes_without_retry_after() {
        let status = RateLimitStatus::allow(4, 1_000);
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, r#"{"allowed":true,"remaining":4,"reset_time":1000}"#);
    }
}
