//! Bounded exponential backoff for reconnecting the queue and socket channels.

use crate::config::ReconnectConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Reconnect attempts allowed after a failure before giving up.
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl Backoff {
    pub fn from_config(c: &ReconnectConfig) -> Self {
        Self {
            max_attempts: c.max_attempts,
            initial: Duration::from_millis(c.initial_delay_ms),
            max: Duration::from_millis(c.max_delay_ms),
        }
    }

    /// Delay before attempt `attempt` (1-based): initial, 2x, 4x, ... capped at `max`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << shift;
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// True once `attempt` exceeds the budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }

    /// Sleep for the delay of `attempt`. Returns false if cancelled first.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay_for(attempt)) => true,
        }
    }
}
