//! Tunnel registry: port allocation and per-tunnel state
//!
//! The registry owns the `public port → tunnel` table and the rotating
//! allocation cursor. Its lock guards only the table; per-tunnel state has
//! its own synchronization so no I/O ever happens under the registry lock.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use portbridge_proto::BrokerMessage;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Port allocation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("no ports available")]
    Exhausted,

    #[error("port {0} already in use")]
    PortInUse(u16),
}

/// Errors raised while setting up a data channel on a tunnel
#[derive(Debug, Error)]
pub enum DataChannelError {
    #[error("tunnel is not active")]
    Inactive,

    #[error("control write failed: {0}")]
    ControlWrite(#[source] io::Error),

    #[error("failed to bind data listener: {0}")]
    Bind(#[source] io::Error),
}

/// Write half of an agent's control connection.
#[derive(Debug)]
pub struct ControlHandle {
    writer: OwnedWriteHalf,
}

impl ControlHandle {
    pub fn new(writer: OwnedWriteHalf) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, msg: &BrokerMessage) -> io::Result<()> {
        self.writer.write_all(msg.encode().as_bytes()).await
    }
}

/// One tunnel: a public port, its listener, and (while an agent is
/// connected) the control connection serving it.
///
/// The control mutex is held across every logical write sequence, so
/// concurrent rendezvous can never interleave their `CONNECT`/`PORT` pairs,
/// and heartbeat replies can never split one.
#[derive(Debug)]
pub struct Tunnel {
    public_port: u16,
    active: AtomicBool,
    /// Attachment epoch, bumped whenever the control slot changes hands.
    /// Sessions act on the tunnel only with the epoch their own `attach`
    /// returned, so a session that already lost the tunnel cannot tear
    /// down or write through its successor's control connection.
    epoch: AtomicU64,
    dormant_since: StdMutex<Option<Instant>>,
    control: Mutex<Option<ControlHandle>>,
}

impl Tunnel {
    fn new(public_port: u16) -> Self {
        Self {
            public_port,
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            dormant_since: StdMutex::new(None),
            control: Mutex::new(None),
        }
    }

    pub fn public_port(&self) -> u16 {
        self.public_port
    }

    /// True iff a control connection is bound and the last heartbeat
    /// succeeded.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// How long this tunnel has been dormant, if it is.
    ///
    /// A tunnel that has been claimed but not yet attached reports `None`,
    /// which keeps it out of the reaper's reach during registration.
    pub fn dormant_for(&self) -> Option<Duration> {
        if self.is_active() {
            return None;
        }
        self.dormant_since.lock().unwrap().map(|since| since.elapsed())
    }

    fn mark_claimed(&self) {
        *self.dormant_since.lock().unwrap() = None;
    }

    /// Return a claimed-but-never-attached tunnel to the dormant pool so
    /// it can be reclaimed or reaped. Only the session holding the claim
    /// may call this.
    pub fn release_claim(&self) {
        if !self.is_active() {
            *self.dormant_since.lock().unwrap() = Some(Instant::now());
        }
    }

    /// Bind a control connection to this tunnel and mark it active.
    ///
    /// Returns the attachment epoch; the owning session passes it back to
    /// [`Tunnel::send`] and [`Tunnel::demote`], which refuse to act once
    /// the tunnel has changed hands.
    pub async fn attach(&self, control: ControlHandle) -> u64 {
        let mut guard = self.control.lock().await;
        *guard = Some(control);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(true, Ordering::SeqCst);
        *self.dormant_since.lock().unwrap() = None;
        debug!(port = self.public_port, epoch, "control connection attached");
        epoch
    }

    /// Drop the control connection and mark the tunnel dormant, provided
    /// `epoch` still names the current attachment. A lingering session
    /// whose tunnel was reclaimed gets a no-op instead of tearing down its
    /// successor. The public listener is untouched either way.
    pub async fn demote(&self, epoch: u64) {
        let mut guard = self.control.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(port = self.public_port, epoch, "ignoring stale demote");
            return;
        }
        self.clear_control(&mut guard);
        debug!(port = self.public_port, "tunnel demoted to dormant");
    }

    fn clear_control(&self, guard: &mut Option<ControlHandle>) {
        // Invalidate the owning session's epoch along with the handle, so
        // its eventual teardown cannot fire again after a reattachment.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        *guard = None;
        *self.dormant_since.lock().unwrap() = Some(Instant::now());
    }

    /// Send a single message on the control channel attached at `epoch`.
    pub async fn send(&self, epoch: u64, msg: &BrokerMessage) -> io::Result<()> {
        let mut guard = self.control.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        match guard.as_mut() {
            Some(handle) => handle.send(msg).await,
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Run the control side of a rendezvous: tell the agent a connection is
    /// waiting, bind an ephemeral listener for the dial-back, and tell the
    /// agent which port to dial.
    ///
    /// The `CONNECT` and `PORT` lines are written under the control mutex as
    /// one unit. A write failure demotes the tunnel; a bind failure only
    /// aborts this rendezvous.
    pub async fn open_data_channel(&self) -> Result<TcpListener, DataChannelError> {
        let mut guard = self.control.lock().await;
        if !self.is_active() {
            return Err(DataChannelError::Inactive);
        }
        let Some(handle) = guard.as_mut() else {
            return Err(DataChannelError::Inactive);
        };

        if let Err(e) = handle.send(&BrokerMessage::Connect).await {
            self.clear_control(&mut guard);
            return Err(DataChannelError::ControlWrite(e));
        }

        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(DataChannelError::Bind)?;
        let data_port = listener
            .local_addr()
            .map_err(DataChannelError::Bind)?
            .port();

        if let Err(e) = handle.send(&BrokerMessage::Port(data_port)).await {
            self.clear_control(&mut guard);
            return Err(DataChannelError::ControlWrite(e));
        }

        debug!(
            port = self.public_port,
            data_port, "data channel listener ready"
        );

        Ok(listener)
    }
}

/// Outcome of claiming a port for a new control session.
pub enum Claim {
    /// A fresh tunnel was inserted; the caller must start its public
    /// listener (or remove the entry if the bind fails).
    Created(Arc<Tunnel>),
    /// A dormant tunnel on the requested port was reclaimed; its listener
    /// is already running.
    Reattached(Arc<Tunnel>),
}

impl Claim {
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        match self {
            Claim::Created(t) | Claim::Reattached(t) => t,
        }
    }
}

#[derive(Debug)]
struct Inner {
    tunnels: HashMap<u16, Arc<Tunnel>>,
    listeners: HashMap<u16, JoinHandle<()>>,
    next_port: u16,
}

/// Registry of all tunnels, keyed by public port.
#[derive(Debug)]
pub struct TunnelRegistry {
    min_port: u16,
    max_port: u16,
    inner: StdMutex<Inner>,
}

impl TunnelRegistry {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            inner: StdMutex::new(Inner {
                tunnels: HashMap::new(),
                listeners: HashMap::new(),
                next_port: min_port,
            }),
        }
    }

    /// Claim a public port for a control session.
    ///
    /// A requested port inside the range wins if it is free or dormant; a
    /// requested port that is currently serving an agent is an error. With
    /// no requested port (or one outside the range) the rotation cursor
    /// scans upward for the first free port and does not wrap within a
    /// single call.
    pub fn claim(&self, requested: Option<u16>) -> Result<Claim, AllocError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(port) = requested {
            if port >= self.min_port && port <= self.max_port {
                return match inner.tunnels.get(&port) {
                    None => Ok(Claim::Created(Self::insert(&mut inner, port))),
                    Some(tunnel) if tunnel.dormant_for().is_some() => {
                        let tunnel = tunnel.clone();
                        tunnel.mark_claimed();
                        Ok(Claim::Reattached(tunnel))
                    }
                    Some(_) => Err(AllocError::PortInUse(port)),
                };
            }
        }

        let mut candidate = inner.next_port as u32;
        while candidate <= self.max_port as u32 {
            let port = candidate as u16;
            if !inner.tunnels.contains_key(&port) {
                inner.next_port = port.saturating_add(1);
                return Ok(Claim::Created(Self::insert(&mut inner, port)));
            }
            candidate += 1;
        }

        Err(AllocError::Exhausted)
    }

    fn insert(inner: &mut Inner, port: u16) -> Arc<Tunnel> {
        let tunnel = Arc::new(Tunnel::new(port));
        inner.tunnels.insert(port, tunnel.clone());
        tunnel
    }

    /// Record the public listener task for a tunnel, replacing (and
    /// aborting) any previous one for the same port.
    pub fn register_listener(&self, port: u16, handle: JoinHandle<()>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.listeners.insert(port, handle) {
            old.abort();
        }
    }

    /// Destroy a tunnel: drop the table entry and abort its listener.
    pub fn remove(&self, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.tunnels.remove(&port);
        if let Some(handle) = inner.listeners.remove(&port) {
            handle.abort();
        }
    }

    /// Destroy every tunnel that has been dormant longer than `grace`.
    /// Returns the reaped ports.
    pub fn reap_dormant(&self, grace: Duration) -> Vec<u16> {
        let mut inner = self.inner.lock().unwrap();

        let expired: Vec<u16> = inner
            .tunnels
            .iter()
            .filter(|(_, tunnel)| tunnel.dormant_for().is_some_and(|d| d >= grace))
            .map(|(port, _)| *port)
            .collect();

        for port in &expired {
            inner.tunnels.remove(port);
            if let Some(handle) = inner.listeners.remove(port) {
                handle.abort();
            }
        }

        expired
    }

    pub fn get(&self, port: u16) -> Option<Arc<Tunnel>> {
        self.inner.lock().unwrap().tunnels.get(&port).cloned()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.inner.lock().unwrap().tunnels.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
