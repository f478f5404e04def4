//! Wire protocol for the portbridge control channel.
//!
//! The control channel is a plain TCP connection carrying one command per
//! LF-terminated text line. [`messages`] defines the typed commands for each
//! direction and [`codec`] provides the incremental line decoder used to read
//! them off a socket.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, LineCodec, LineReader};
pub use messages::{AgentCommand, BrokerMessage, ProtocolError};
