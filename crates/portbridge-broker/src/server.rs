//! Broker server: control accept loop and dormant-tunnel reaping

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::{interval, sleep};
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::registry::TunnelRegistry;
use crate::session;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Broker errors
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },

    #[error("failed to bind control port {port}: {source}")]
    ControlBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// The broker: owns the control listener and the tunnel registry.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<TunnelRegistry>,
    control_listener: TcpListener,
    control_addr: SocketAddr,
}

impl Broker {
    /// Bind the control listener. Failure here is fatal to the process.
    pub async fn bind(config: BrokerConfig) -> Result<Self, BrokerError> {
        if config.min_port > config.max_port {
            return Err(BrokerError::InvalidPortRange {
                min: config.min_port,
                max: config.max_port,
            });
        }

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.control_port));
        let control_listener =
            TcpListener::bind(addr)
                .await
                .map_err(|source| BrokerError::ControlBind {
                    port: config.control_port,
                    source,
                })?;
        let control_addr = control_listener
            .local_addr()
            .map_err(|source| BrokerError::ControlBind {
                port: config.control_port,
                source,
            })?;

        let registry = Arc::new(TunnelRegistry::new(config.min_port, config.max_port));

        info!(
            control_port = control_addr.port(),
            min_port = config.min_port,
            max_port = config.max_port,
            "broker listening"
        );

        Ok(Self {
            config,
            registry,
            control_listener,
            control_addr,
        })
    }

    /// The address the control listener actually bound (useful when the
    /// configured port was 0).
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Shared handle to the tunnel registry.
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Serve control sessions and reap dormant tunnels, forever.
    pub async fn run(self) -> Result<(), BrokerError> {
        let accept_loop = async {
            loop {
                match self.control_listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(session::run_control_session(
                            stream,
                            peer,
                            self.registry.clone(),
                            self.config.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "control accept failed");
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        };

        let reap_loop = async {
            let mut ticker = interval(self.config.reap_interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                for port in self.registry.reap_dormant(self.config.dormant_grace) {
                    info!(port, "reaped dormant tunnel");
                }
            }
        };

        tokio::select! {
            _ = accept_loop => {}
            _ = reap_loop => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_rejects_inverted_range() {
        let config = BrokerConfig {
            control_port: 0,
            min_port: 20000,
            max_port: 10000,
            ..BrokerConfig::default()
        };

        let err = Broker::bind(config).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvalidPortRange { .. }));
    }

    #[tokio::test]
    async fn test_bind_reports_actual_control_port() {
        let config = BrokerConfig {
            control_port: 0,
            ..BrokerConfig::default()
        };

        let broker = Broker::bind(config).await.unwrap();
        assert_ne!(broker.control_addr().port(), 0);
        assert!(broker.registry().is_empty());
    }
}
