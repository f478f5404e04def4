//! Broker integration tests - control sessions, allocation, and tunnel
//! lifecycle against a real broker on localhost.
//!
//! Each test uses its own public-port range so tests can run in parallel.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use portbridge_broker::{Broker, BrokerConfig, TunnelRegistry};
use portbridge_proto::{AgentCommand, BrokerMessage, LineReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
}

fn test_config(min_port: u16, max_port: u16) -> BrokerConfig {
    BrokerConfig {
        control_port: 0,
        min_port,
        max_port,
        handshake_timeout: Duration::from_millis(500),
        heartbeat_timeout: Duration::from_secs(2),
        // Long enough that nothing is reaped unless a test shrinks it.
        dormant_grace: Duration::from_secs(60),
        reap_interval: Duration::from_millis(50),
    }
}

async fn start_broker(config: BrokerConfig) -> (SocketAddr, Arc<TunnelRegistry>) {
    init_logging();
    let broker = Broker::bind(config).await.unwrap();
    let port = broker.control_addr().port();
    let registry = broker.registry();
    tokio::spawn(async move {
        let _ = broker.run().await;
    });
    (SocketAddr::from(([127, 0, 0, 1], port)), registry)
}

/// Minimal scripted agent speaking the control protocol directly.
struct ControlClient {
    lines: LineReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: LineReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, cmd: &AgentCommand) {
        self.writer.write_all(cmd.encode().as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Option<BrokerMessage> {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for broker")
            .unwrap()?;
        Some(line.parse().expect("unparseable broker line"))
    }

    async fn register(addr: SocketAddr, requested: Option<u16>) -> (Self, BrokerMessage) {
        let mut client = Self::connect(addr).await;
        client.send(&AgentCommand::New { port: requested }).await;
        let reply = client.recv().await.expect("broker closed before replying");
        (client, reply)
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

async fn expect_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("connection was not closed in time")
        .unwrap();
    assert_eq!(n, 0, "expected the broker to close the connection");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_allocates_ports_in_range_order() {
    let (addr, registry) = start_broker(test_config(41000, 41004)).await;

    let (_a, reply_a) = ControlClient::register(addr, None).await;
    let (_b, reply_b) = ControlClient::register(addr, None).await;

    assert_eq!(reply_a, BrokerMessage::Assigned(41000));
    assert_eq!(reply_b, BrokerMessage::Assigned(41001));
    assert_eq!(registry.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_specific_port_request_creates_listener() {
    let (addr, _registry) = start_broker(test_config(41100, 41110)).await;

    let (mut agent, reply) = ControlClient::register(addr, Some(41105)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41105));

    // The public listener is up, and each inbound connection produces a
    // CONNECT / PORT pair on the control channel.
    let _public = TcpStream::connect("127.0.0.1:41105").await.unwrap();

    assert_eq!(agent.recv().await, Some(BrokerMessage::Connect));
    match agent.recv().await {
        Some(BrokerMessage::Port(data_port)) => assert_ne!(data_port, 0),
        other => panic!("expected PORT line, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_range_exhaustion_returns_error() {
    let (addr, _registry) = start_broker(test_config(41200, 41200)).await;

    let (_first, reply) = ControlClient::register(addr, None).await;
    assert_eq!(reply, BrokerMessage::Assigned(41200));

    let (mut second, reply) = ControlClient::register(addr, None).await;
    assert_eq!(
        reply,
        BrokerMessage::Error("no ports available".to_string())
    );
    // The broker closes the losing session.
    assert_eq!(second.recv().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requested_port_already_active_is_rejected() {
    let (addr, _registry) = start_broker(test_config(41300, 41310)).await;

    let (_first, reply) = ControlClient::register(addr, Some(41305)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41305));

    let (_second, reply) = ControlClient::register(addr, Some(41305)).await;
    assert_eq!(
        reply,
        BrokerMessage::Error("port 41305 already in use".to_string())
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_reclaims_port_and_listener_survives() {
    let (addr, registry) = start_broker(test_config(41400, 41410)).await;

    let (agent, reply) = ControlClient::register(addr, Some(41405)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41405));

    // Agent goes away; the tunnel must become dormant, not disappear.
    drop(agent);
    wait_until(
        || registry.get(41405).is_some_and(|t| !t.is_active()),
        "tunnel to go dormant",
    )
    .await;

    // Dormant: the listener still accepts but immediately closes.
    let mut public = TcpStream::connect("127.0.0.1:41405").await.unwrap();
    expect_closed(&mut public).await;

    // Reconnect with the remembered port.
    let (_agent, reply) = ControlClient::register(addr, Some(41405)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41405));
    assert_eq!(registry.len(), 1);
    assert!(registry.get(41405).unwrap().is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_agent_is_demoted_and_rendezvous_rejected() {
    let mut config = test_config(41500, 41510);
    config.heartbeat_timeout = Duration::from_millis(300);
    let (addr, registry) = start_broker(config).await;

    let (_agent, reply) = ControlClient::register(addr, Some(41505)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41505));
    assert!(registry.get(41505).unwrap().is_active());

    // Never send PING; the broker must demote the tunnel.
    wait_until(
        || registry.get(41505).is_some_and(|t| !t.is_active()),
        "silent agent to be demoted",
    )
    .await;

    let mut public = TcpStream::connect("127.0.0.1:41505").await.unwrap();
    expect_closed(&mut public).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_registrations_get_unique_ports() {
    let (addr, registry) = start_broker(test_config(41600, 41607)).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        handles.push(tokio::spawn(async move {
            ControlClient::register(addr, None).await
        }));
    }

    let mut clients = Vec::new();
    let mut ports = HashSet::new();
    for handle in handles {
        let (client, reply) = handle.await.unwrap();
        match reply {
            BrokerMessage::Assigned(port) => {
                assert!((41600..=41607).contains(&port));
                assert!(ports.insert(port), "port {port} assigned twice");
            }
            other => panic!("registration failed: {other:?}"),
        }
        clients.push(client);
    }

    assert_eq!(ports.len(), 8);
    assert_eq!(registry.len(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reaper_destroys_expired_dormant_tunnels() {
    let mut config = test_config(41700, 41710);
    config.dormant_grace = Duration::from_millis(200);
    let (addr, registry) = start_broker(config).await;

    let (agent, reply) = ControlClient::register(addr, Some(41705)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41705));
    assert_eq!(registry.len(), 1);

    drop(agent);
    wait_until(|| registry.is_empty(), "dormant tunnel to be reaped").await;

    // The listener went down with the tunnel.
    wait_until_refused("127.0.0.1:41705").await;
}

async fn wait_until_refused(addr: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if TcpStream::connect(addr).await.is_err() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "listener on {addr} was never torn down"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_heartbeat_keeps_tunnel_active() {
    let mut config = test_config(41800, 41810);
    config.heartbeat_timeout = Duration::from_millis(500);
    let (addr, registry) = start_broker(config).await;

    let (mut agent, reply) = ControlClient::register(addr, Some(41805)).await;
    assert_eq!(reply, BrokerMessage::Assigned(41805));

    // Ping well past the bare deadline; the session must stay up.
    for _ in 0..6 {
        sleep(Duration::from_millis(200)).await;
        agent.send(&AgentCommand::Ping).await;
        assert_eq!(agent.recv().await, Some(BrokerMessage::Pong));
    }
    assert!(registry.get(41805).unwrap().is_active());

    // Going silent demotes it.
    wait_until(
        || registry.get(41805).is_some_and(|t| !t.is_active()),
        "tunnel to go dormant after pings stop",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_hello_is_rejected() {
    let (addr, registry) = start_broker(test_config(41900, 41910)).await;

    let mut client = ControlClient::connect(addr).await;
    client.send_raw("OPEN SESAME\n").await;

    assert_eq!(
        client.recv().await,
        Some(BrokerMessage::Error("unrecognized command".to_string()))
    );
    assert_eq!(client.recv().await, None);
    assert!(registry.is_empty());
}
