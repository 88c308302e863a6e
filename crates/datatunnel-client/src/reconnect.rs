//! Reconnection logic with backoff
//!
//! One manager covers both policies used for the control stream: a fixed
//! interval between attempts, and exponential backoff with a ceiling.

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (1.0 = fixed interval)
    pub multiplier: f64,
}

impl ReconnectConfig {
    /// Wait the same `interval` before every attempt
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1.0,
        }
    }

    /// Start at 2s and double up to 600s
    pub fn exponential() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(600),
            multiplier: 2.0,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before next reconnection attempt, unless `cancel` fires first
    pub async fn wait_or_cancel(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        let backoff = self.next_backoff();
        tokio::select! {
            _ = sleep(backoff) => Ok(()),
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
        }
    }

    /// Count an attempt and advance the backoff, returning the delay to wait now
    fn next_backoff(&mut self) -> Duration {
        self.attempt += 1;

        let backoff = self.current_backoff;
        debug!(
            attempt = self.attempt,
            backoff_ms = backoff.as_millis() as u64,
            "Waiting before reconnection attempt"
        );

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next_backoff.min(self.config.max_backoff);

        backoff
    }

    /// Reset backoff (call after successful connection)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get current backoff duration
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
