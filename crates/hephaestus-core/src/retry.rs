//! Exponential backoff with jitter for transient network failures.
//!
//! Attempt `n` (1-indexed) delays by `base * 2^(n-1)`, multiplied by a random
//! factor in `[1 - jitter, 1 + jitter]` and capped at `max_delay`.

use std::time::Duration;

/// Backoff parameters for one retry loop.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0.0 disables jitter; 1.0 allows the full +/- 100% band.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

/// Delay before retrying after attempt `attempt` failed (1-indexed).
pub fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(exponent));
    let capped = raw.min(config.max_delay);
    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let random: f64 = rng.r#gen();
    let factor = 1.0 - jitter + random * 2.0 * jitter;
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_s: u64) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(max_s),
            jitter: 0.0,
        }
    }

    #[test]
    fn doubles_per_attempt_without_jitter() {
        let config = no_jitter(500, 60);
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(2000));
    }

    #[test]
    fn caps_at_max_delay() {
        let config = no_jitter(500, 2);
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_band() {
        let config = BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = backoff_delay(&config, 1).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay), "delay {delay} out of band");
        }
    }
}
