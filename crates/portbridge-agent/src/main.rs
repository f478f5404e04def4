//! portbridge agent CLI
//!
//! Connects to a broker and exposes a local TCP service on the public port
//! the broker assigns.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use portbridge_agent::{Agent, AgentConfig};

/// portbridge agent - exposes a local TCP service through a broker
#[derive(Parser, Debug)]
#[command(name = "portbridge-agent")]
#[command(about = "portbridge agent - exposes a local TCP service through a broker")]
#[command(version)]
#[command(long_about = r#"
The agent keeps a persistent control connection to a broker and forwards
every inbound public connection to a service on this host. If the broker
becomes unreachable the agent reconnects with a fixed backoff, asking for
the same public port it held before.

EXAMPLES:
  # Expose a local web server through a broker on this machine
  portbridge-agent --service-port 8080

  # Expose port 5432 through a remote broker
  portbridge-agent --server broker.example.com --port 8088 --service-port 5432
"#)]
struct Args {
    /// Broker address
    #[arg(long, short = 's', env = "PORTBRIDGE_SERVER", default_value = "localhost")]
    server: String,

    /// Broker control port
    #[arg(long, short = 'p', env = "PORTBRIDGE_PORT", default_value_t = 8088)]
    port: u16,

    /// Local service port to forward
    #[arg(long, short = 'l', env = "PORTBRIDGE_SERVICE_PORT", default_value_t = 80)]
    service_port: u16,

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

    let config = AgentConfig {
        broker_host: args.server,
        broker_port: args.port,
        service_port: args.service_port,
        ..AgentConfig::default()
    };

    info!(
        broker = %config.broker_addr(),
        service_port = config.service_port,
        "starting agent"
    );

    let agent = Agent::new(config);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
        _ = agent.run() => {}
    }

    Ok(())
}
