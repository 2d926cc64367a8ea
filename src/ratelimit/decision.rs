//! Rate limit decisions as handed back to callers.

use serde::Serialize;

use super::store::StoreError;

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Requests left in the current window, never negative
    pub remaining: u32,
    /// Maximum requests allowed in the window
    pub limit: u32,
    /// Unix timestamp (seconds) when the window resets
    pub reset_at: i64,
}

impl RateLimitResult {
    /// Seconds a rejected caller should wait, measured from `now`.
    /// Zero for allowed requests.
    pub fn retry_after_at(&self, now: i64) -> u64 {
        if self.allowed {
            0
        } else {
            self.reset_at.saturating_sub(now).max(0) as u64
        }
    }

    /// Seconds a rejected caller should wait from the current time.
    pub fn retry_after(&self) -> u64 {
        self.retry_after_at(chrono::Utc::now().timestamp())
    }

    /// HTTP headers describing this decision.
    ///
    /// `Retry-After` is only present on rejections.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.to_string()),
        ];
        if !self.allowed {
            headers.push(("Retry-After", self.retry_after().to_string()));
        }
        headers
    }
}

/// What happened during a check.
///
/// The limiter never turns store trouble into an error for its caller, but it
/// keeps the degraded path visible here so handlers and tests can tell a
/// counted decision from a guess.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The store counted the request and the decision reflects it.
    Enforced(RateLimitResult),
    /// The store failed; the request is let through without being counted.
    FailedOpen {
        result: RateLimitResult,
        error: StoreError,
    },
}

impl CheckOutcome {
    /// The decision, whichever way it was reached.
    pub fn result(&self) -> &RateLimitResult {
        match self {
            CheckOutcome::Enforced(result) => result,
            CheckOutcome::FailedOpen { result, .. } => result,
        }
    }

    pub fn into_result(self) -> RateLimitResult {
        match self {
            CheckOutcome::Enforced(result) => result,
            CheckOutcome::FailedOpen { result, .. } => result,
        }
    }

    /// Whether the decision was made without the store.
    pub fn is_degraded(&self) -> bool {
        matches!(self, CheckOutcome::FailedOpen { .. })
    }
}
