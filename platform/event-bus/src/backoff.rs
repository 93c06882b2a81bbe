//! Delivery policy and backoff schedules
//!
//! The broker drives redelivery on the consume side: a message that is not
//! acknowledged comes back after the schedule entry for its delivery count.
//! `retry_with_backoff` covers the few places the application itself retries
//! (connecting to the broker at startup).

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Ordered waits between successive attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule(Vec<Duration>);

impl BackoffSchedule {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self(steps)
    }

    /// `steps` waits starting at `initial`, doubling each time
    pub fn exponential(initial: Duration, steps: usize) -> Self {
        let mut next = initial;
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            out.push(next);
            next = next.saturating_mul(2);
        }
        Self(out)
    }

    /// Wait after the `attempt`-th failure (1-based); the last step repeats
    pub fn delay_for(&self, attempt: u64) -> Option<Duration> {
        let idx = attempt.saturating_sub(1) as usize;
        self.0.get(idx).or_else(|| self.0.last()).copied()
    }

    pub fn steps(&self) -> &[Duration] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Redelivery settings for a durable consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Deliveries allowed before the message is abandoned
    pub max_deliver: u32,
    /// How long a delivery may stay unacknowledged
    pub ack_wait: Duration,
    /// Waits between redeliveries
    pub backoff: BackoffSchedule,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            backoff: BackoffSchedule::exponential(Duration::from_secs(1), 5),
        }
    }
}

impl DeliveryPolicy {
    /// When an unacknowledged `delivered`-th delivery comes back
    pub fn redelivery_delay(&self, delivered: u64) -> Duration {
        self.backoff.delay_for(delivered).unwrap_or(self.ack_wait)
    }

    /// True once `delivered` has used the whole delivery budget
    pub fn is_exhausted(&self, delivered: u64) -> bool {
        delivered >= u64::from(self.max_deliver)
    }
}

/// Configuration for application-side retries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Retry a fallible async operation with capped exponential backoff
///
/// # Example
/// ```rust
/// use event_bus::backoff::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "connect_broker",
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    context = %context,
                    attempts = attempt,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    context = %context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );
                sleep(backoff).await;
                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
