/*!
 * Retry backoff
 *
 * Delay before attempt `k` re-runs, per strategy:
 *
 * - exponential: `min(max_delay, base_delay * 2^(k-1))`
 * - linear:      `min(max_delay, base_delay * k)`
 * - fixed:       `base_delay`
 *
 * With jitter enabled the result is multiplied by a uniform factor in
 * `[0.5, 1.5)` to spread thundering herds.
 */

use rand::Rng;
use std::time::Duration;

use crate::task::{RetryConfig, RetryStrategy};

/// Delay before the given (1-based) attempt runs.
pub fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let raw_ms = match config.strategy {
        RetryStrategy::Exponential => config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt - 1)),
        RetryStrategy::Linear => config.base_delay_ms.saturating_mul(attempt as u64),
        RetryStrategy::Fixed => config.base_delay_ms,
    };

    let capped_ms = match config.strategy {
        RetryStrategy::Fixed => raw_ms,
        _ => raw_ms.min(config.max_delay_ms),
    };

    if config.jitter {
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((capped_ms as f64 * factor) as u64)
    } else {
        Duration::from_millis(capped_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: RetryStrategy, jitter: bool) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            strategy,
            base_delay_ms: 1_000,
            max_delay_ms: 8_000,
            jitter,
        }
    }

    #[test]
    fn test_exponential_doubles_then_caps() {
        let c = config(RetryStrategy::Exponential, false);
        assert_eq!(backoff(&c, 1), Duration::from_millis(1_000));
        assert_eq!(backoff(&c, 2), Duration::from_millis(2_000));
        assert_eq!(backoff(&c, 3), Duration::from_millis(4_000));
        assert_eq!(backoff(&c, 4), Duration::from_millis(8_000));
        // Capped at max_delay
        assert_eq!(backoff(&c, 10), Duration::from_millis(8_000));
    }

    #[test]
    fn test_linear_grows_then_caps() {
        let c = config(RetryStrategy::Linear, false);
        assert_eq!(backoff(&c, 1), Duration::from_millis(1_000));
        assert_eq!(backoff(&c, 3), Duration::from_millis(3_000));
        assert_eq!(backoff(&c, 20), Duration::from_millis(8_000));
    }

    #[test]
    fn test_fixed_is_flat() {
        let c = config(RetryStrategy::Fixed, false);
        assert_eq!(backoff(&c, 1), Duration::from_millis(1_000));
        assert_eq!(backoff(&c, 9), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let c = config(RetryStrategy::Exponential, true);
        for _ in 0..100 {
            let d = backoff(&c, 2).as_millis() as u64;
            // 2000 * [0.5, 1.5)
            assert!((1_000..3_000).contains(&d), "jittered delay out of band: {d}");
        }
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let c = config(RetryStrategy::Exponential, false);
        assert_eq!(backoff(&c, 0), backoff(&c, 1));
    }
}
