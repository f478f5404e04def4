//! Broker-side control sessions
//!
//! One session per accepted control connection: read the hello, allocate a
//! port, then serve heartbeats until the agent goes away. Every exit path
//! leaves the tunnel dormant, never destroyed — reaping is the registry's
//! job.

use std::net::SocketAddr;
use std::sync::Arc;

use portbridge_proto::{AgentCommand, BrokerMessage, LineReader};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::public;
use crate::registry::{Claim, ControlHandle, TunnelRegistry};

pub(crate) async fn run_control_session(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<TunnelRegistry>,
    config: BrokerConfig,
) {
    debug!(%peer, "control connection established");

    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut writer = write_half;

    let hello = match reader.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            debug!(%peer, "control connection closed before hello");
            return;
        }
        Err(e) => {
            warn!(%peer, error = %e, "control read failed");
            return;
        }
    };

    let requested = match hello.parse::<AgentCommand>() {
        Ok(AgentCommand::New { port }) => port,
        Ok(AgentCommand::Ping) | Err(_) => {
            warn!(%peer, line = %hello, "unrecognized hello");
            send_error(&mut writer, "unrecognized command").await;
            return;
        }
    };

    let claim = match registry.claim(requested) {
        Ok(claim) => claim,
        Err(e) => {
            warn!(%peer, ?requested, error = %e, "allocation failed");
            send_error(&mut writer, &e.to_string()).await;
            return;
        }
    };

    let (tunnel, created) = match claim {
        Claim::Created(tunnel) => (tunnel, true),
        Claim::Reattached(tunnel) => (tunnel, false),
    };
    let port = tunnel.public_port();

    if created {
        match public::bind_public(port) {
            Ok(listener) => {
                let handle = tokio::spawn(public::run_public_listener(
                    listener,
                    tunnel.clone(),
                    config.handshake_timeout,
                ));
                registry.register_listener(port, handle);
            }
            Err(e) => {
                warn!(%peer, port, error = %e, "public listener bind failed");
                registry.remove(port);
                send_error(&mut writer, &format!("bind failed: {e}")).await;
                return;
            }
        }
    }

    // Reply with the assigned port before the tunnel goes active: once it
    // is active, a rendezvous on an already-running listener could write
    // CONNECT ahead of the port line the agent is waiting for.
    let reply = BrokerMessage::Assigned(port).encode();
    if let Err(e) = writer.write_all(reply.as_bytes()).await {
        warn!(%peer, port, error = %e, "failed to send port reply");
        tunnel.release_claim();
        return;
    }

    let epoch = tunnel.attach(ControlHandle::new(writer)).await;

    info!(%peer, port, reused = !created, "tunnel serving");

    loop {
        match timeout(config.heartbeat_timeout, reader.next_line()).await {
            Err(_) => {
                debug!(port, "heartbeat deadline expired");
                break;
            }
            Ok(Ok(None)) => {
                debug!(port, "control connection closed");
                break;
            }
            Ok(Err(e)) => {
                warn!(port, error = %e, "control read failed");
                break;
            }
            Ok(Ok(Some(line))) => match line.parse::<AgentCommand>() {
                Ok(AgentCommand::Ping) => {
                    if let Err(e) = tunnel.send(epoch, &BrokerMessage::Pong).await {
                        warn!(port, error = %e, "failed to send heartbeat reply");
                        break;
                    }
                }
                _ => {
                    warn!(port, line = %line, "unexpected control line");
                    break;
                }
            },
        }
    }

    tunnel.demote(epoch).await;
    info!(port, "control session ended");
}

async fn send_error(writer: &mut OwnedWriteHalf, message: &str) {
    let reply = BrokerMessage::Error(message.to_string()).encode();
    if let Err(e) = writer.write_all(reply.as_bytes()).await {
        debug!(error = %e, "failed to send error reply");
    }
}
