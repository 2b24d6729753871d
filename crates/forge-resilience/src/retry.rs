use std::time::Duration;

use forge_core::config::ResilienceConfig;
use rand::Rng;

/// Exponential backoff with a jitter fraction added on top.
///
/// Schedule with the defaults: 1 s → 2 s → 4 s → … → 30 s (cap), for at most
/// [`RetryPolicy::max_attempts`] timer-driven attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Fraction of the base delay added at random (0.1 = up to +10 %).
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_delay_ms),
            cap: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    /// Same schedule with jitter disabled.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `min(cap, base · 2^attempt)`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        base + base.mul_f64(rng.random_range(0.0..=self.jitter))
    }

    /// Whether the controller's own timer may not retry any more.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}
