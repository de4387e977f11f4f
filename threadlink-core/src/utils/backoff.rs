use rand::Rng;
use std::time::Duration;

/// Exponent past which the delay is always capped.
const MAX_EXPONENT: u32 = 20;

/// Delay before retry number `attempt` (zero-based).
///
/// Exponential backoff: `base * 2^attempt`, never above `max`.
pub fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.pow(attempt.min(MAX_EXPONENT));
    base.saturating_mul(factor).min(max)
}

/// Add up to 10% random jitter so that many failing events do not retry in
/// lockstep.
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() / 10;
    if spread == 0 {
        return delay;
    }
    let extra = rand::rng().random_range(0..=spread as u64);
    delay + Duration::from_millis(extra)
}
