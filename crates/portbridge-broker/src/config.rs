//! Broker configuration

use std::time::Duration;

/// Configuration for the broker.
///
/// The timing knobs carry the protocol defaults; tests compress them to keep
/// scenarios fast. The CLI only exposes the ports.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Port the control listener binds to. Port 0 picks an ephemeral port.
    pub control_port: u16,

    /// Lowest public port handed out to tunnels (inclusive).
    pub min_port: u16,

    /// Highest public port handed out to tunnels (inclusive).
    pub max_port: u16,

    /// How long a rendezvous may wait for the agent to dial back.
    pub handshake_timeout: Duration,

    /// Read deadline on the control channel. An agent that stays silent
    /// longer than this is considered gone and its tunnel goes dormant.
    pub heartbeat_timeout: Duration,

    /// How long a dormant tunnel is preserved for reconnection before the
    /// reaper destroys it.
    pub dormant_grace: Duration,

    /// How often the reaper scans for expired dormant tunnels.
    pub reap_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_port: 8088,
            min_port: 10000,
            max_port: 20000,
            handshake_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(10),
            dormant_grace: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.control_port, 8088);
        assert_eq!(config.min_port, 10000);
        assert_eq!(config.max_port, 20000);
        assert!(config.dormant_grace > config.heartbeat_timeout);
    }
}
