//! Per-tunnel public listeners and the broker side of the rendezvous

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use portbridge_connection::splice;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::registry::{DataChannelError, Tunnel};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Bind a public listener with SO_REUSEADDR set, so a port freed by a
/// reaped tunnel can be rebound while its old sockets sit in TIME_WAIT.
pub(crate) fn bind_public(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Accept loop for one tunnel's public port. Runs until the tunnel is
/// destroyed; accept errors are retried after a brief pause.
pub(crate) async fn run_public_listener(
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    handshake_timeout: Duration,
) {
    let port = tunnel.public_port();
    info!(port, "public listener started");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(port, %peer, "public connection accepted");
                let tunnel = tunnel.clone();
                tokio::spawn(run_rendezvous(stream, peer, tunnel, handshake_timeout));
            }
            Err(e) => {
                warn!(port, error = %e, "public accept failed");
                sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Pair one public connection with a fresh data channel from the agent.
///
/// Any failure closes the public connection and whatever was set up so far;
/// the tunnel itself is only demoted if the control channel proves dead.
async fn run_rendezvous(
    public: TcpStream,
    peer: SocketAddr,
    tunnel: Arc<Tunnel>,
    handshake_timeout: Duration,
) {
    let port = tunnel.public_port();

    let data_listener = match tunnel.open_data_channel().await {
        Ok(listener) => listener,
        Err(DataChannelError::Inactive) => {
            debug!(port, %peer, "tunnel not active, rejecting connection");
            return;
        }
        Err(e) => {
            warn!(port, %peer, error = %e, "rendezvous setup failed");
            return;
        }
    };

    let data = match timeout(handshake_timeout, data_listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(port, %peer, error = %e, "data channel accept failed");
            return;
        }
        Err(_) => {
            warn!(port, %peer, "agent did not dial back in time");
            return;
        }
    };
    drop(data_listener);

    debug!(port, %peer, "data channel established");

    let summary = splice(public, data).await;

    debug!(
        port,
        %peer,
        bytes_in = summary.a_to_b,
        bytes_out = summary.b_to_a,
        "public connection closed"
    );
}
