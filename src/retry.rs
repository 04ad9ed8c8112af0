//! Bounded retry for remote calls
//!
//! Every call into a custodian session or the work queue goes through
//! [`retry`], so attempt counts and delays live in one place.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How often and how patiently a remote call is retried
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Applied to the delay after each failed attempt; 1.0 keeps it fixed
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    3000
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Same attempt count, no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay to wait after `attempt` (1-based) has failed
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

/// Run `op` until it succeeds or the policy's attempts are spent.
///
/// Returns the last error when every attempt failed.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => {
                warn!("{} failed after {} attempts: {}", op_name, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} attempt {}/{} failed: {} (retrying in {:?})",
                    op_name, attempt, attempts, e, delay
                );
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
