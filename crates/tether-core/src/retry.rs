//! Backoff parameters for transient-failure retries.
//!
//! The retry loop itself lives in `tether-store`'s `ResilientStore`; this
//! module only computes how long to wait.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// First backoff step, ms.
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;
/// Backoff ceiling, ms.
pub const DEFAULT_MAX_DELAY_MS: u64 = 2_000;
/// Fraction of the delay that jitter may add or remove.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;

/// Exponential backoff with a ceiling and symmetric jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, ms. Doubles per retry.
    pub base_delay_ms: u64,
    /// Ceiling applied before jitter, ms.
    pub max_delay_ms: u64,
    /// Jitter spread, `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (zero-based), without jitter.
    #[must_use]
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Backoff before retry `attempt` (zero-based). `random` is a sample in
    /// `[0.0, 1.0)`; `0.5` yields exactly [`ceiling`](Self::ceiling).
    #[must_use]
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        let spread = self.jitter_factor.clamp(0.0, 1.0);
        let scale = 1.0 + spread * (2.0 * random.clamp(0.0, 1.0) - 1.0);
        let ceiling = self.ceiling(attempt);
        Duration::try_from_secs_f64(ceiling.as_secs_f64() * scale).unwrap_or(ceiling)
    }
}
