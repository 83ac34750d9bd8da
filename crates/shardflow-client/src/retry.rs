//! Retry with exponential backoff for gateway calls.
//!
//! Both gateways retry transient errors internally so callers never stack
//! their own retries on top. Delays grow exponentially from
//! `initial_delay` up to `max_delay`, with a small deterministic jitter to
//! de-synchronize workers that fail in lockstep.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts after the initial one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of the delay used as jitter range (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Fixed spacing, no exponential growth. Used by the checkpoint
    /// persistence loop.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Delay before retry `attempt` (1-indexed; attempt 0 is the initial
    /// try and has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent to keep powi well away from overflow
        let capped = attempt.min(30);
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped as i32 - 1);
        let capped_delay = base.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            // deterministic low-discrepancy jitter keyed on the attempt
            let phase = (attempt as f64 * 0.618_033_988_749_895) % 1.0;
            capped_delay * self.jitter_factor * (phase - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

/// Run `operation`, retrying transient failures per `config`. The first
/// non-transient error (including `ConditionalCheckFailed`) is returned
/// immediately.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, error = %err, "retrying transient error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
