//! Retry policy with jittered exponential backoff.
//!
//! One policy drives fetch retries, mutation retries, and realtime
//! reconnection, so backoff behavior stays uniform and testable instead
//! of being re-derived at every call site.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::SyncError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY_MS: u64 = 250;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER_MS: u64 = 100;

/// Bounded exponential backoff with clock-derived jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: Duration::from_millis(DEFAULT_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential growth
    /// capped at `max_delay`, plus jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let scaled = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(capped.saturating_add(jitter_ms(self.jitter)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is exhausted. The final error is returned
    /// unchanged.
    pub async fn run<T, F, Fut>(&self, label: &'static str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < budget => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn jitter_ms(window: Duration) -> u64 {
    let window_ms = window.as_millis() as u64;
    if window_ms == 0 {
        return 0;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .subsec_nanos() as u64;
    nanos % window_ms
}
