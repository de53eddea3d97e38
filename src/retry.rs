//! Retry primitives: bounded attempt policies and an injectable delay.

use async_trait::async_trait;
use std::time::Duration;

/// Waits between retry attempts.
///
/// Production code sleeps on the tokio timer; tests substitute
/// [`RecordingDelay`] so retries complete instantly and can be counted.
#[async_trait]
pub(crate) trait Delay: Send + Sync {
    async fn wait(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry: total attempts (including the first) and a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy; at least one attempt is always made.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// True if another attempt may follow `attempt` (1-based).
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(2))
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingDelay;
