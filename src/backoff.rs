//! Retry delay computation, decoupled from any sleeping mechanism.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::config::BackoffPolicy;

/// Delay before the next attempt after `attempts` failed or completed
/// attempts: `base * 2^(attempts - 1)`, capped. Monotonic in `attempts`.
pub fn backoff_delay(attempts: u32, policy: &BackoffPolicy) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    policy
        .base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(policy.cap)
}

/// Deterministic per-record jitter, at most a tenth of `delay`. Seeded by the
/// record id so records that failed together spread out, and re-evaluating
/// the same record gives the same answer.
pub fn jitter(delay: Duration, seed: i64) -> Duration {
    let ceiling_ms = (delay.as_millis() / 10) as u64;
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    let spread = (seed.unsigned_abs() % 700) + 50;
    Duration::from_millis(spread % (ceiling_ms + 1))
}

pub fn next_retry_at(
    now: DateTime<Utc>,
    attempts: u32,
    policy: &BackoffPolicy,
    seed: i64,
) -> DateTime<Utc> {
    let delay = backoff_delay(attempts, policy);
    let total = delay + jitter(delay, seed);
    now + ChronoDuration::from_std(total).unwrap_or_else(|_| ChronoDuration::seconds(1))
}
