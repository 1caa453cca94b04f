//! Backoff computation
//!
//! Two distinct laws: the stored per-call backoff doubles up to the
//! subscriber's configured cap, while controller loops recovering from
//! store errors use a short jittered delay so a fleet of controllers does
//! not hammer the store in lockstep.

use std::time::Duration;

use rand::Rng;

/// Next scheduled backoff for a failed call: double, capped
pub fn next_backoff_ms(current_ms: i64, max_ms: i64) -> i64 {
    current_ms.saturating_mul(2).min(max_ms).max(1)
}

const LOOP_RETRY_BASE_MS: u64 = 100;
const LOOP_RETRY_CAP_MS: u64 = 5_000;

/// Jittered delay before a controller loop retries after an error
pub fn loop_retry_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.min(16);
    let base = LOOP_RETRY_BASE_MS
        .saturating_mul(1u64 << exp)
        .min(LOOP_RETRY_CAP_MS);
    // 50%..150% of the base
    let jittered = rand::thread_rng().gen_range(base / 2..=base + base / 2);
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_backoff_doubles() {
        assert_eq!(next_backoff_ms(100, 10_000), 200);
        assert_eq!(next_backoff_ms(200, 10_000), 400);
    }

    #[test]
    fn test_next_backoff_caps_at_max() {
        assert_eq!(next_backoff_ms(6_000, 10_000), 10_000);
        assert_eq!(next_backoff_ms(10_000, 10_000), 10_000);
    }

    #[test]
    fn test_next_backoff_never_zero() {
        assert_eq!(next_backoff_ms(0, 10_000), 1);
    }

    #[test]
    fn test_next_backoff_overflow_saturated() {
        assert_eq!(next_backoff_ms(i64::MAX, i64::MAX), i64::MAX);
    }

    #[test]
    fn test_loop_retry_delay_bounded() {
        for failures in 0..20 {
            let delay = loop_retry_delay(failures);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(7_500));
        }
    }

    #[test]
    fn test_loop_retry_delay_grows() {
        // With jitter in [0.5, 1.5], eight failures always beats zero failures
        let early = loop_retry_delay(0);
        let late = loop_retry_delay(8);
        assert!(late > early);
    }
}
