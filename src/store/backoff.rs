//! Reconnect delay calculation.

use std::time::Duration;

/// Jitter percentage for exponential backoff (±20%).
///
/// Randomized delays keep many instances from reconnecting in lockstep after
/// the store restarts.
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Minimum delay between reconnection attempts in milliseconds.
const MIN_RECONNECT_DELAY_MS: u64 = 100;

/// Generate a random jitter value between 0.0 and 1.0.
pub fn rand_jitter() -> f64 {
    use rand::Rng;
    rand::rng().random::<f64>()
}

/// Delay before connect attempt `attempt + 1`, after `attempt` failures.
///
/// `base * 2^(attempt-1)` capped at `max`, then jittered by ±20% and floored at
/// [`MIN_RECONNECT_DELAY_MS`].
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);

    let delay_ms = base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(max_ms);

    let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let final_ms = (delay_ms as i64)
        .saturating_add(jitter)
        .max(MIN_RECONNECT_DELAY_MS as i64) as u64;

    Duration::from_millis(final_ms)
}
