//! Rate / Concurrency Limiter (component B).
//!
//! Two independent in-memory sliding-window counters, keyed by user id and
//! by remote address respectively. Loss on restart is acceptable — these are
//! abuse-prevention counters, not durable state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitDecision {
    Allow,
    Deny { retry_after: Duration },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allow)
    }
}

/// A single sliding-window counter keyed by an arbitrary string.
///
/// Shared implementation backing both the per-user submission limiter and
/// the per-address endpoint protection limiter described in §4.B.
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check and, if allowed, record a request for `key` against the given
    /// `max_requests` per `window`. Pruning happens on every call so memory
    /// is bounded by recently-active keys.
    pub fn check(&self, key: &str, max_requests: u32, window: Duration) -> LimitDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter mutex poisoned");
        let entry = windows.entry(key.to_string()).or_default();

        entry.retain(|ts| now.duration_since(*ts) < window);

        if entry.len() as u32 >= max_requests {
            let oldest = *entry.iter().min().expect("non-empty after retain check");
            let elapsed = now.duration_since(oldest);
            let retry_after = window.saturating_sub(elapsed);
            return LimitDecision::Deny { retry_after };
        }

        entry.push(now);
        LimitDecision::Allow
    }

    /// Current retained count for `key` within `window`, without recording
    /// a new request.
    pub fn count(&self, key: &str, window: Duration) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("limiter mutex poisoned");
        let entry = windows.entry(key.to_string()).or_default();
        entry.retain(|ts| now.duration_since(*ts) < window);
        entry.len()
    }
}

/// Bundles the per-user submission limiter with the per-address endpoint
/// protection limiters used across submit/read paths.
pub struct Limiter {
    pub per_user: SlidingWindowLimiter,
    pub per_address: SlidingWindowLimiter,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        Self {
            per_user: SlidingWindowLimiter::new(),
            per_address: SlidingWindowLimiter::new(),
        }
    }
}

fn format_retry(decision: &LimitDecision, max_requests: u32, window: Duration) -> String {
    match decision {
        LimitDecision::Allow => String::new(),
        LimitDecision::Deny { retry_after } => format!(
            "Maximum {} requests per {}s. Retry after {}s.",
            max_requests,
            window.as_secs(),
            retry_after.as_secs() + 1
        ),
    }
}

/// Human-readable message for a denied submission-rate check.
pub fn submission_rate_message(decision: &LimitDecision, max_requests: u32, window: Duration) -> String {
    format!("Rate limit exceeded. {}", format_retry(decision, max_requests, window))
}

/// Human-readable message for a denied endpoint-protection check.
pub fn endpoint_rate_message(decision: &LimitDecision, max_requests: u32, window: Duration) -> String {
    format!("Too many requests. {}", format_retry(decision, max_requests, window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_denies() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.check("alice", 5, window).is_allowed());
        }
        let decision = limiter.check("alice", 5, window);
        assert!(!decision.is_allowed());
    }

    #[test]
    fn distinct_keys_have_independent_windows() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            assert!(limiter.check("alice", 5, window).is_allowed());
        }
        // bob's window is untouched by alice's requests
        assert!(limiter.check("bob", 5, window).is_allowed());
    }

    #[test]
    fn sixth_request_in_window_is_denied_with_retry_hint() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);
        for _ in 0..5 {
            limiter.check("alice", 5, window);
        }
        match limiter.check("alice", 5, window) {
            LimitDecision::Deny { retry_after } => {
                assert!(retry_after <= window);
            }
            LimitDecision::Allow => panic!("expected deny on 6th request"),
        }
    }

    #[test]
    fn count_does_not_consume_a_slot() {
        let limiter = SlidingWindowLimiter::new();
        let window = Duration::from_secs(60);
        limiter.check("alice", 5, window);
        assert_eq!(limiter.count("alice", window), 1);
        assert_eq!(limiter.count("alice", window), 1);
    }
}
