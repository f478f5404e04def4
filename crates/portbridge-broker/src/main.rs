//! portbridge broker CLI
//!
//! Runs the publicly-reachable relay that agents connect to. Agents get a
//! public port from the configured range; external clients connecting to
//! that port are relayed to the agent's local service.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portbridge_broker::{Broker, BrokerConfig};

/// portbridge broker - relays public TCP connections to agents behind NAT
#[derive(Parser, Debug)]
#[command(name = "portbridge-broker")]
#[command(about = "portbridge broker - relays public TCP connections to agents behind NAT")]
#[command(version)]
#[command(long_about = r#"
The broker listens for agent control connections on the control port and
hands each agent a public port from the configured range. Traffic arriving
on a public port is relayed through a per-connection data channel to the
agent's local service.

EXAMPLES:
  # Start a broker on the default control port
  portbridge-broker

  # Custom control port and a narrow tunnel range
  portbridge-broker --port 9000 --min-port 15000 --max-port 15100
"#)]
struct Args {
    /// Control port that agents connect to
    #[arg(long, short = 'p', env = "PORTBRIDGE_PORT", default_value_t = 8088)]
    port: u16,

    /// Lowest public port handed out to tunnels
    #[arg(long, env = "PORTBRIDGE_MIN_PORT", default_value_t = 10000)]
    min_port: u16,

    /// Highest public port handed out to tunnels
    #[arg(long, env = "PORTBRIDGE_MAX_PORT", default_value_t = 20000)]
    max_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    let config = BrokerConfig {
        control_port: args.port,
        min_port: args.min_port,
        max_port: args.max_port,
        ..BrokerConfig::default()
    };

    let broker = Broker::bind(config)
        .await
        .context("failed to start broker")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        result = broker.run() => {
            if let Err(e) = result {
                error!(error = %e, "broker failed");
                return Err(e.into());
            }
        }
    }

    Ok(())
}
