//! Shared jittered exponential backoff used by the queue engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Delay before attempt `attempt` (1-based): `base * 2^(attempt-1)` scaled by
/// a uniform factor in `[1-jitter, 1+jitter]`, rounded to milliseconds and
/// clamped at zero.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, jitter: f64) -> u64 {
    use rand::Rng;
    debug_assert!((0.0..1.0).contains(&jitter));

    let exponent = attempt.saturating_sub(1).min(20);
    let raw = base_ms.saturating_mul(1_u64 << exponent);

    let mut rng = rand::thread_rng();
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    ((raw as f64) * factor).round().max(0.0) as u64
}

pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        for _ in 0..50 {
            let first = backoff_delay_ms(1_000, 1, 0.3);
            let second = backoff_delay_ms(1_000, 2, 0.3);
            let third = backoff_delay_ms(1_000, 3, 0.3);

            assert!((700..=1_300).contains(&first), "attempt 1: {first}");
            assert!((1_400..=2_600).contains(&second), "attempt 2: {second}");
            assert!((2_800..=5_200).contains(&third), "attempt 3: {third}");
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        assert_eq!(backoff_delay_ms(500, 1, 0.0), 500);
        assert_eq!(backoff_delay_ms(500, 4, 0.0), 4_000);
    }
}
