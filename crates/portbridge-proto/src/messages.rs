//! Protocol message types
//!
//! Every message occupies exactly one line; fields are whitespace-separated
//! decimal values. Lines are trimmed before parsing, so `"PING\r\n"` and
//! `"PING\n"` are equivalent on receipt.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Protocol parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unrecognized command: {0:?}")]
    UnrecognizedCommand(String),

    #[error("invalid port in {0:?}")]
    InvalidPort(String),

    #[error("unexpected message: {0:?}")]
    UnexpectedMessage(String),
}

/// Commands sent by the agent on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Request a tunnel. `port` asks for a specific public port; `None`
    /// lets the broker pick one from its range.
    New { port: Option<u16> },
    /// Liveness probe; the broker answers with [`BrokerMessage::Pong`].
    Ping,
}

/// Messages sent by the broker on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    /// Successful allocation reply carrying the public port.
    Assigned(u16),
    /// Allocation or protocol failure; the session ends after this.
    Error(String),
    /// An inbound public connection is waiting; a `Port` line follows.
    Connect,
    /// Dial this broker port to establish the data channel.
    Port(u16),
    /// Heartbeat reply.
    Pong,
}

impl AgentCommand {
    /// Encode as a wire line, including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl BrokerMessage {
    /// Encode as a wire line, including the terminating newline.
    pub fn encode(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCommand::New { port: None } => write!(f, "NEW"),
            AgentCommand::New { port: Some(p) } => write!(f, "NEW {p}"),
            AgentCommand::Ping => write!(f, "PING"),
        }
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerMessage::Assigned(port) => write!(f, "{port}"),
            BrokerMessage::Error(msg) => write!(f, "ERROR {msg}"),
            BrokerMessage::Connect => write!(f, "CONNECT"),
            BrokerMessage::Port(port) => write!(f, "PORT {port}"),
            BrokerMessage::Pong => write!(f, "PONG"),
        }
    }
}

impl FromStr for AgentCommand {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("NEW") => match fields.next() {
                None => Ok(AgentCommand::New { port: None }),
                Some(raw) => {
                    let port = raw
                        .parse::<u16>()
                        .map_err(|_| ProtocolError::InvalidPort(line.to_string()))?;
                    Ok(AgentCommand::New { port: Some(port) })
                }
            },
            Some("PING") => Ok(AgentCommand::Ping),
            _ => Err(ProtocolError::UnrecognizedCommand(line.to_string())),
        }
    }
}

impl FromStr for BrokerMessage {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        if let Some(msg) = line.strip_prefix("ERROR") {
            return Ok(BrokerMessage::Error(msg.trim().to_string()));
        }

        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("CONNECT") => Ok(BrokerMessage::Connect),
            Some("PONG") => Ok(BrokerMessage::Pong),
            Some("PORT") => {
                let raw = fields
                    .next()
                    .ok_or_else(|| ProtocolError::InvalidPort(line.to_string()))?;
                let port = raw
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidPort(line.to_string()))?;
                Ok(BrokerMessage::Port(port))
            }
            Some(raw) if raw.chars().all(|c| c.is_ascii_digit()) => {
                let port = raw
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::InvalidPort(line.to_string()))?;
                Ok(BrokerMessage::Assigned(port))
            }
            _ => Err(ProtocolError::UnrecognizedCommand(line.to_string())),
        }
    }
}
