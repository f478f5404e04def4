//! One control session with the broker
//!
//! A [`Session`] owns its socket halves outright and is built fresh for
//! every connect attempt, so a failed session can never leak state (or a
//! stale task) into its successor. A single reader dispatches both
//! rendezvous commands and heartbeat replies; the heartbeat branch only
//! writes.

use std::time::Duration;

use portbridge_connection::splice;
use portbridge_proto::{AgentCommand, BrokerMessage, CodecError, LineReader, ProtocolError};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;

/// Errors that can occur in the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("broker rejected registration: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("control channel error: {0}")]
    Codec(#[from] CodecError),

    #[error("control write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker missed the heartbeat deadline")]
    HeartbeatTimeout,

    #[error("control connection closed by broker")]
    ConnectionClosed,
}

/// One established control session.
pub struct Session {
    reader: LineReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    assigned_port: u16,
    broker_host: String,
    service_port: u16,
    ping_interval: Duration,
    pong_timeout: Duration,
}

impl Session {
    /// Dial the broker and register, optionally asking for a previously
    /// assigned public port.
    pub async fn connect(
        config: &AgentConfig,
        requested_port: Option<u16>,
    ) -> Result<Self, AgentError> {
        let broker_addr = config.broker_addr();
        let stream =
            TcpStream::connect(&broker_addr)
                .await
                .map_err(|source| AgentError::DialFailed {
                    addr: broker_addr.clone(),
                    source,
                })?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = LineReader::new(read_half);
        let mut writer = write_half;

        let hello = AgentCommand::New {
            port: requested_port,
        };
        writer.write_all(hello.encode().as_bytes()).await?;

        let reply = reader
            .next_line()
            .await?
            .ok_or(AgentError::ConnectionClosed)?;
        let assigned_port = match reply.parse::<BrokerMessage>()? {
            BrokerMessage::Assigned(port) => port,
            BrokerMessage::Error(msg) => return Err(AgentError::Rejected(msg)),
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.to_string()).into());
            }
        };

        info!(
            broker = %broker_addr,
            public_port = assigned_port,
            service_port = config.service_port,
            "tunnel established"
        );

        Ok(Self {
            reader,
            writer,
            assigned_port,
            broker_host: config.broker_host.clone(),
            service_port: config.service_port,
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
        })
    }

    /// The public port the broker assigned to this session.
    pub fn assigned_port(&self) -> u16 {
        self.assigned_port
    }

    /// Serve the session: dispatch broker commands and keep the heartbeat
    /// going. Returns only on failure; a clean agent shutdown drops the
    /// session instead.
    pub async fn serve(mut self) -> Result<(), AgentError> {
        let mut ping_timer = interval(self.ping_interval);
        ping_timer.tick().await; // first tick completes immediately

        // Deadline for the PONG answering the oldest unanswered PING.
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    self.writer
                        .write_all(AgentCommand::Ping.encode().as_bytes())
                        .await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.pong_timeout);
                    }
                }

                _ = deadline_elapsed(pong_deadline), if pong_deadline.is_some() => {
                    warn!(public_port = self.assigned_port, "no PONG from broker");
                    return Err(AgentError::HeartbeatTimeout);
                }

                line = self.reader.next_line() => {
                    match line? {
                        None => return Err(AgentError::ConnectionClosed),
                        Some(line) => self.dispatch(&line, &mut pong_deadline).await?,
                    }
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        line: &str,
        pong_deadline: &mut Option<Instant>,
    ) -> Result<(), AgentError> {
        match line.parse::<BrokerMessage>()? {
            BrokerMessage::Pong => {
                *pong_deadline = None;
                Ok(())
            }
            BrokerMessage::Connect => {
                // The PORT line follows CONNECT immediately; the broker
                // writes the pair as one unit.
                let follow = self
                    .reader
                    .next_line()
                    .await?
                    .ok_or(AgentError::ConnectionClosed)?;
                let data_port = match follow.parse::<BrokerMessage>()? {
                    BrokerMessage::Port(port) => port,
                    other => {
                        return Err(ProtocolError::UnexpectedMessage(other.to_string()).into());
                    }
                };

                tokio::spawn(run_rendezvous(
                    self.broker_host.clone(),
                    data_port,
                    self.service_port,
                ));
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedMessage(other.to_string()).into()),
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Connect the local service with a fresh data channel and splice them.
///
/// Failures here are logged and abandon only this rendezvous; the control
/// session keeps serving.
async fn run_rendezvous(broker_host: String, data_port: u16, service_port: u16) {
    let local_addr = format!("localhost:{service_port}");
    let local = match TcpStream::connect(&local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(addr = %local_addr, error = %e, "failed to reach local service");
            return;
        }
    };

    let data_addr = format!("{broker_host}:{data_port}");
    let data = match TcpStream::connect(&data_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(addr = %data_addr, error = %e, "failed to dial data channel");
            return;
        }
    };

    debug!(data_port, "data channel established");

    let summary = splice(local, data).await;

    debug!(
        data_port,
        bytes_out = summary.a_to_b,
        bytes_in = summary.b_to_a,
        "rendezvous finished"
    );
}
