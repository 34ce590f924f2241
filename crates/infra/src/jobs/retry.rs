//! Retry scheduling policy.
//!
//! Two tiers, in order of precedence:
//!
//! 1. An upstream rate-limit hint (`"Resets at: <epoch seconds>"` in the
//!    failure message) schedules the retry just past the reset.
//! 2. Otherwise exponential backoff: `min(base * 2^attempts, max)`.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::Serialize;

static RESETS_AT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Resets at: (\d+)").expect("static regex is valid"));

/// Why a retry was scheduled at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryReason {
    /// Upstream told us when the limit resets.
    RateLimited { reset_at: DateTime<Utc> },
    /// Exponential backoff.
    Backoff { delay_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub next_attempt_at: DateTime<Utc>,
    pub reason: RetryReason,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry (multiplied by `2^attempts`)
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
    /// Added past an upstream rate-limit reset
    pub rate_limit_margin: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            rate_limit_margin: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for a job that had `attempts` recorded failures before
    /// the current one.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Upstream reset time carried by a failure message, if any.
    pub fn rate_limit_reset(message: &str) -> Option<DateTime<Utc>> {
        let caps = RESETS_AT.captures(message)?;
        let secs: i64 = caps.get(1)?.as_str().parse().ok()?;
        DateTime::from_timestamp(secs, 0)
    }

    /// Whether a job whose failure count just became `attempts_after_failure`
    /// has used up its allowance.
    pub fn is_exhausted(&self, attempts_after_failure: u32, max_attempts: u32) -> bool {
        attempts_after_failure >= max_attempts
    }

    /// Decide when to run a failed job next.
    pub fn next_attempt(&self, attempts: u32, error_message: &str, now: DateTime<Utc>) -> RetryDecision {
        if let Some(reset_at) = Self::rate_limit_reset(error_message) {
            return RetryDecision {
                next_attempt_at: add_saturating(reset_at, self.rate_limit_margin),
                reason: RetryReason::RateLimited { reset_at },
            };
        }

        let delay = self.backoff_delay(attempts);
        RetryDecision {
            next_attempt_at: add_saturating(now, delay),
            reason: RetryReason::Backoff {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }
}

fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn exponential_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(16_000));
    }

    #[test]
    fn backoff_is_capped_at_thirty_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(5), Duration::from_millis(30_000));
        assert_eq!(policy.backoff_delay(40), Duration::from_millis(30_000));
    }

    #[test]
    fn second_attempt_failure_retries_two_seconds_later() {
        let t = at_millis(1_700_000_000_000);
        let decision = RetryPolicy::default().next_attempt(1, "connection reset", t);

        assert_eq!(decision.next_attempt_at, t + TimeDelta::milliseconds(2000));
        assert_eq!(decision.reason, RetryReason::Backoff { delay_ms: 2000 });
    }

    #[test]
    fn rate_limit_hint_overrides_backoff() {
        let t = at_millis(1_700_000_000_000);
        let reset_secs = 1_700_000_000 + 600;
        let message = format!("GitHub API rate limit exceeded. Resets at: {reset_secs}");

        let decision = RetryPolicy::default().next_attempt(4, &message, t);

        assert_eq!(
            decision.next_attempt_at,
            t + TimeDelta::milliseconds(600_000 + 5000)
        );
        assert!(matches!(decision.reason, RetryReason::RateLimited { .. }));
    }

    #[test]
    fn message_without_hint_has_no_reset() {
        assert!(RetryPolicy::rate_limit_reset("rate limited, try later").is_none());
        assert!(RetryPolicy::rate_limit_reset("Resets at: soon").is_none());
    }

    #[test]
    fn exhausted_once_failures_reach_max_attempts() {
        let policy = RetryPolicy::default();

        assert!(!policy.is_exhausted(1, 3));
        assert!(!policy.is_exhausted(2, 3));
        assert!(policy.is_exhausted(3, 3));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap_and_never_shrinks(attempts in 0u32..200) {
            let policy = RetryPolicy::default();
            let current = policy.backoff_delay(attempts);
            let next = policy.backoff_delay(attempts + 1);

            prop_assert!(current <= policy.max_delay);
            prop_assert!(next >= current);
        }
    }
}
