// src/retry.rs
//! Exponential backoff shared by the producer and the consumer.
//!
//! The policy knows nothing about what it wraps. Each attempt gets mutable
//! access to caller-owned state (usually the queue client), so an attempt can
//! tear down and rebuild a channel before the next one runs.

use futures::future::BoxFuture;
use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means a single attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    pub fn exponential(max_retries: u32, base_delay_ms: u64) -> Self {
        Self::new(max_retries, Duration::from_millis(base_delay_ms), 2.0)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay to wait before retry number `retry` (1-based):
    /// `base_delay * multiplier^(retry - 1)`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Runs `operation` until it succeeds or the retries are used up, in
    /// which case the last error is returned.
    pub async fn retry<S, T, E, F>(&self, label: &str, state: &mut S, mut operation: F) -> Result<T, E>
    where
        S: ?Sized,
        E: Display,
        F: for<'s> FnMut(&'s mut S) -> BoxFuture<'s, Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match operation(&mut *state).await {
                Ok(value) => return Ok(value),
                Err(err) if retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_for_retry(retry);
                    warn!(
                        operation = label,
                        attempt = retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
