//! Agent configuration

use std::time::Duration;

/// Configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Broker hostname or IP.
    pub broker_host: String,

    /// Broker control port.
    pub broker_port: u16,

    /// Local service port that tunneled connections are forwarded to.
    pub service_port: u16,

    /// How often a PING is sent on the control channel.
    pub ping_interval: Duration,

    /// How long to wait for the matching PONG before declaring the broker
    /// gone.
    pub pong_timeout: Duration,

    /// Pause between reconnection attempts after a session fails.
    pub reconnect_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 8088,
            service_port: 80,
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

impl AgentConfig {
    /// The broker control endpoint in `host:port` form.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}
