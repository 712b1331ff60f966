use serde::{Deserialize, Serialize};
use vendorchat_api::ValidationLimits;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Policy {
    pub max_body_bytes: usize,
    pub backoff_initial_ms: u64,
    pub backoff_factor: u32,
    pub backoff_max_ms: u64,
    pub backoff_jitter_ms: u64,
    pub max_send_attempts: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_body_bytes: 8 * 1024,
            backoff_initial_ms: 1000,
            backoff_factor: 2,
            backoff_max_ms: 30_000,
            backoff_jitter_ms: 250,
            max_send_attempts: 5,
        }
    }
}

impl Policy {
    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_body_bytes: self.max_body_bytes,
        }
    }

    /// Delay before the next attempt once `failed_attempts` sends have
    /// failed, without jitter.
    pub fn backoff_delay_ms(&self, failed_attempts: u32) -> u64 {
        let exponent = failed_attempts.saturating_sub(1).min(32);
        let factor = u64::from(self.backoff_factor.max(1)).saturating_pow(exponent);
        self.backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms)
    }
}
