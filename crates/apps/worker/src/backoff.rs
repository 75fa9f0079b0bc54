use std::time::Duration;

/// Delay before retry number `retry_count`: `base * 2^retry_count`, capped.
#[must_use]
pub fn backoff_delay(base: Duration, cap: Duration, retry_count: i32) -> Duration {
    let exponent = u32::try_from(retry_count).unwrap_or(0).min(31);
    base.saturating_mul(1_u32 << exponent).min(cap)
}
