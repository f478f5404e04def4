//! Reconnection pacing for the agent's control session

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay between attempts
    pub delay: Duration,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

/// Retry errors
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("max retry attempts reached")]
    MaxAttemptsReached,
}

/// Paces reconnection attempts with a fixed delay.
pub struct RetryDelay {
    config: RetryConfig,
    attempt: usize,
}

impl RetryDelay {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Wait before the next attempt.
    pub async fn wait(&mut self) -> Result<(), RetryError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(RetryError::MaxAttemptsReached);
            }
        }

        debug!(
            "waiting {}ms before attempt {}",
            self.config.delay.as_millis(),
            self.attempt
        );

        sleep(self.config.delay).await;
        Ok(())
    }

    /// Reset the attempt counter (call after a successful connection).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Current attempt number.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
