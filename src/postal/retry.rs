//! Back-off policy for transient geocoding failures.

use super::types::LookupError;
use crate::config::ResolverConfig;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResolverConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay_ms.clamp(1, DEFAULT_MAX_DELAY_MS),
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }

    pub fn from_config(config: &ResolverConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay_ms)
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, 1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the next attempt. A service-provided `Retry-After`
    /// wins over the back-off; both stay under the cap.
    pub fn delay_for_retry(&self, failed_attempt: u32, error: &LookupError) -> Duration {
        if let Some(retry_after_ms) = error.retry_after_ms() {
            return Duration::from_millis(retry_after_ms.min(self.max_delay_ms));
        }

        // attempt=1 -> base, attempt=2 -> base*2, attempt=3 -> base*4, capped.
        let exponent = failed_attempt.saturating_sub(1).min(6);
        let multiplier = 1_u64 << exponent;
        let backoff_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        let jitter_ms = compute_jitter_ms(backoff_ms);
        Duration::from_millis(backoff_ms.saturating_add(jitter_ms).min(self.max_delay_ms))
    }
}

fn compute_jitter_ms(backoff_ms: u64) -> u64 {
    let jitter_cap = backoff_ms / 4; // 25% jitter upper bound
    if jitter_cap == 0 {
        return 0;
    }

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_nanos()))
        .unwrap_or(0);

    nanos % jitter_cap
}
