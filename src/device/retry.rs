use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// How a device loop waits between failed attempts and when it gives up.
///
/// `attempt` counts consecutive failures starting at 1; a success resets it.
/// `max_attempts = None` retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
    /// Fraction of the delay (0.0..=1.0) randomly added or removed.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: ms,
            max_delay_ms: ms,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }

    /// Delay before the next attempt after `attempt` consecutive failures, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.initial_delay_ms
                    .saturating_mul(factor)
                    .min(self.max_delay_ms.max(self.initial_delay_ms))
            }
        };
        Duration::from_millis(ms)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rng.gen_range(-spread..=spread);
        base.mul_f64(factor.max(0.0))
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_delay_ms == 0 {
            anyhow::bail!("Retry delay must be greater than zero");
        }

        if self.strategy == BackoffStrategy::Exponential && self.max_delay_ms < self.initial_delay_ms {
            anyhow::bail!("Maximum retry delay cannot be smaller than the initial delay");
        }

        if !(0.0..=1.0).contains(&self.jitter) {
            anyhow::bail!("Retry jitter must be between 0.0 and 1.0");
        }

        if self.max_attempts == Some(0) {
            anyhow::bail!("Maximum retry attempts cannot be zero");
        }

        Ok(())
    }
}

/// Sleeps for `delay` unless the token fires first. Returns `true` when cancelled.
pub async fn sleep_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
