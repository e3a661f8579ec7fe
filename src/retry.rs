// Backoff policy shared by the orchestrator, the delivery router and the
// funding guard.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    Exponential,
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Upper bound of the random extra delay, as a fraction of the computed delay
    pub jitter: f64,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.1,
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl BackoffPolicy {
    /// Same policy with a different attempt budget
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before retry number `attempt + 1`, without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = match self.strategy {
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Exponential => {
                let factor = self.multiplier.max(1.0).powi(attempt as i32);
                (self.base_delay_ms as f64 * factor).min(u64::MAX as f64) as u64
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }

    /// Delay before retry number `attempt + 1`, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let remaining = max_attempts - attempt - 1;
                    if remaining == 0 || !is_retryable(&e) {
                        return Err(e);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt = attempt + 1,
                        remaining,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
