//! Exponential backoff with full jitter for Bus reconnection (spec §4.3).

use std::time::Duration;

use rand::Rng;

const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(30);
pub const DEGRADED_AFTER_ATTEMPTS: u32 = 10;
pub const DEGRADED_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Full-jitter backoff: `delay = random(0, min(cap, base * 2^attempt))`.
pub fn next_delay(attempt: u32) -> Duration {
    let exp = BASE.as_millis().saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(CAP.as_millis());
    let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        for attempt in 0..20 {
            let d = next_delay(attempt);
            assert!(d <= CAP);
        }
    }

    #[test]
    fn degraded_threshold_matches_spec() {
        assert_eq!(DEGRADED_AFTER_ATTEMPTS, 10);
    }
}
