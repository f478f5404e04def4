//! Reconnecting agent driver

use portbridge_connection::{RetryConfig, RetryDelay};
use tracing::warn;

use crate::config::AgentConfig;
use crate::session::Session;

/// Runs control sessions in a loop, reconnecting with a fixed backoff and
/// remembering the assigned public port so a reconnect reclaims it.
pub struct Agent {
    config: AgentConfig,
    assigned_port: Option<u16>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            assigned_port: None,
        }
    }

    /// The public port held by the most recent successful session, if any.
    pub fn assigned_port(&self) -> Option<u16> {
        self.assigned_port
    }

    /// Run forever: establish a session, serve it until it fails, back off,
    /// reconnect.
    pub async fn run(mut self) {
        let mut retry = RetryDelay::new(RetryConfig {
            delay: self.config.reconnect_delay,
            max_attempts: None,
        });

        loop {
            match Session::connect(&self.config, self.assigned_port).await {
                Ok(session) => {
                    self.assigned_port = Some(session.assigned_port());
                    retry.reset();
                    if let Err(e) = session.serve().await {
                        warn!(error = %e, "control session ended");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to establish tunnel");
                }
            }

            // Unlimited attempts: wait() cannot fail here.
            let _ = retry.wait().await;
        }
    }
}
