//! Connection state machine and session task.
//!
//! # Responsibilities
//! - Dial (client side) or wrap an accepted stream (server side)
//! - Run the hello / server-ready handshake
//! - Run the session loop: ping, drain inbound frames, sleep
//! - Serialize writes through one per-connection lock
//! - Shut down exactly once and tell the owning server
//!
//! # Status
//! ```text
//! ready:    false ──(handshake done)──▶ true
//! active:   false ──(activate)───────▶ true      (client side starts active)
//! shutdown: false ──(shutdown)───────▶ true
//! ```
//! No bit ever goes back. The session task only holds a weak reference, so
//! dropping every handle to a connection also stops its session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::config::validation::{collect, validate_codec, validate_connection};
use crate::config::{ConfigError, ConnectionConfig, Settings};
use crate::net::queue::{InboundQueue, QueueError};
use crate::net::watchdog::Watchdog;
use crate::observability::metrics;
use crate::protocol::{CodecError, Inbound, MessageCodec};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which end of the link a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ClientSide,
    ServerSide,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::ClientSide => "client",
            Role::ServerSide => "server",
        }
    }
}

/// Errors surfaced by connection operations.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    FailedToConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection is shut down or the peer stopped answering.
    #[error("host unreachable")]
    UnreachableHost,

    /// `read_int` found a non-integer at the head of the queue.
    #[error("expected an integer, found {0:?}")]
    BadMessagesSequence(String),

    /// A control token arrived where the protocol forbids it.
    #[error("bad setup: {0}")]
    BadSetup(&'static str),

    /// The first frame a server-side connection received was not hello.
    #[error("handshake rejected: expected hello, got {0}")]
    HandshakeRejected(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<QueueError> for ConnectionError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::ShutDown => ConnectionError::UnreachableHost,
            QueueError::BadMessagesSequence(head) => ConnectionError::BadMessagesSequence(head),
        }
    }
}

/// Receives deregistration requests from server-side connections.
pub trait DisconnectNotifier: Send + Sync {
    /// Called once, when the connection shuts down. Must not block.
    fn notify_disconnection(&self, id: ConnectionId);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Status {
    ready: bool,
    active: bool,
    shutdown: bool,
}

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

struct Inner {
    id: ConnectionId,
    peer: SocketAddr,
    role: Role,
    config: ConnectionConfig,
    codec: Arc<MessageCodec>,
    status: watch::Sender<Status>,
    queue: InboundQueue,
    /// Woken for every decoded inbound frame.
    arrivals: Notify,
    writer: Arc<tokio::sync::Mutex<Option<FrameWriter>>>,
    watchdog: Watchdog,
    session: Mutex<Option<JoinHandle<()>>>,
    notifier: Option<Weak<dyn DisconnectNotifier>>,
    faults: AtomicU64,
    last_fault: Mutex<Option<CodecError>>,
    runtime: Handle,
}

/// One end of a framed, handshaken TCP link.
///
/// Cheap to clone; every clone drives the same link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = *self.inner.status.borrow();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("role", &self.inner.role)
            .field("ready", &status.ready)
            .field("active", &status.active)
            .field("shutdown", &status.shutdown)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Dial `addr` using the codec and connection sections of `settings`.
    pub async fn connect(addr: &str, settings: &Settings) -> Result<Self, ConnectionError> {
        collect(validate_codec(&settings.codec)).map_err(ConfigError::Validation)?;
        let codec = Arc::new(MessageCodec::new(settings.codec.clone()));
        Self::connect_with(addr, settings.connection.clone(), codec).await
    }

    /// Dial `addr` with an explicit codec, e.g. one carrying a cipher.
    pub async fn connect_with(
        addr: &str,
        config: ConnectionConfig,
        codec: Arc<MessageCodec>,
    ) -> Result<Self, ConnectionError> {
        collect(validate_connection(&config)).map_err(ConfigError::Validation)?;
        let failed = |source| ConnectionError::FailedToConnect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect(addr).await.map_err(failed)?;
        let peer = stream.peer_addr().map_err(failed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Self::spawn(stream, peer, Role::ClientSide, config, codec, None))
    }

    /// Wrap an accepted stream. The session stays parked until [`activate`].
    ///
    /// [`activate`]: Connection::activate
    pub(crate) fn accepted(
        stream: TcpStream,
        peer: SocketAddr,
        config: ConnectionConfig,
        codec: Arc<MessageCodec>,
        notifier: Weak<dyn DisconnectNotifier>,
    ) -> Self {
        Self::spawn(stream, peer, Role::ServerSide, config, codec, Some(notifier))
    }

    fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        role: Role,
        config: ConnectionConfig,
        codec: Arc<MessageCodec>,
        notifier: Option<Weak<dyn DisconnectNotifier>>,
    ) -> Self {
        let framing = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(config.max_frame_bytes)
                .new_codec()
        };
        let (read_half, write_half) = stream.into_split();
        let frames = FramedRead::new(read_half, framing());
        let writer = FramedWrite::new(write_half, framing());

        let (status, _) = watch::channel(Status {
            active: role == Role::ClientSide,
            ..Status::default()
        });

        let inner = Arc::new(Inner {
            id: ConnectionId::new(),
            peer,
            role,
            watchdog: Watchdog::new(config.ttl_secs),
            config,
            codec,
            status,
            queue: InboundQueue::new(),
            arrivals: Notify::new(),
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            session: Mutex::new(None),
            notifier,
            faults: AtomicU64::new(0),
            last_fault: Mutex::new(None),
            runtime: Handle::current(),
        });

        tracing::info!(
            connection_id = %inner.id,
            peer_addr = %inner.peer,
            role = role.as_str(),
            "Connection opened"
        );
        metrics::record_connection_opened(role.as_str());

        let task = tokio::spawn(run_session(Arc::downgrade(&inner), frames));
        *lock(&inner.session) = Some(task);

        Self { inner }
    }

    /// Let a server-side session start its handshake. Idempotent.
    pub(crate) fn activate(&self) {
        self.inner.status.send_if_modified(|status| {
            let changed = !status.active;
            status.active = true;
            changed
        });
    }

    /// Send an application payload once the handshake is done.
    pub async fn write(&self, payload: &str) -> Result<(), ConnectionError> {
        self.inner.wait_until_ready().await?;
        let frame = self.inner.codec.encode(payload)?;
        self.inner.send(frame, "data").await
    }

    /// Send an integer as its decimal text.
    pub async fn write_int(&self, value: i32) -> Result<(), ConnectionError> {
        self.write(&value.to_string()).await
    }

    /// Pop the next payload, waiting for the handshake and for data.
    pub async fn read(&self) -> Result<String, ConnectionError> {
        self.inner.wait_until_ready().await?;
        Ok(self.inner.queue.pop().await?)
    }

    /// Pop the next payload as an integer.
    ///
    /// On [`ConnectionError::BadMessagesSequence`] the payload stays queued and
    /// a following [`read`](Connection::read) returns it verbatim.
    pub async fn read_int(&self) -> Result<i32, ConnectionError> {
        self.inner.wait_until_ready().await?;
        Ok(self.inner.queue.pop_int().await?)
    }

    /// Send a ping and time how long until the peer is heard from again.
    ///
    /// Fails with [`ConnectionError::UnreachableHost`] when nothing arrives
    /// within the probe timeout. A timeout does not shut the connection down.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        self.inner.wait_until_ready().await?;
        let frame = self.inner.codec.encode_ping()?;

        let arrival = self.inner.arrivals.notified();
        tokio::pin!(arrival);
        arrival.as_mut().enable();
        let mut status = self.inner.status.subscribe();

        let started = Instant::now();
        let round_trip = async {
            self.inner.send(frame, "ping").await?;
            tokio::select! {
                _ = arrival => Ok(()),
                _ = status.wait_for(|s| s.shutdown) => Err(ConnectionError::UnreachableHost),
            }
        };
        tokio::time::timeout(self.inner.config.probe_timeout(), round_trip)
            .await
            .map_err(|_| ConnectionError::UnreachableHost)??;
        Ok(started.elapsed())
    }

    /// Tear the connection down. Only the first call has any effect.
    pub fn shutdown(&self) {
        self.inner.shut_down();
    }

    /// `true` until shutdown.
    pub fn is_connected(&self) -> bool {
        !self.inner.status.borrow().shutdown
    }

    pub fn is_ready(&self) -> bool {
        self.inner.status.borrow().ready
    }

    /// `true` if a `read` would return without waiting for the peer.
    pub fn is_data_available(&self) -> bool {
        !self.inner.queue.is_empty()
    }

    pub fn is_server_side(&self) -> bool {
        self.inner.role == Role::ServerSide
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.inner.watchdog.ttl_secs())
    }

    /// Number of payloads waiting to be read.
    pub fn pending(&self) -> usize {
        self.inner.queue.size()
    }

    /// Count of inbound frames discarded as undefined.
    pub fn protocol_faults(&self) -> u64 {
        self.inner.faults.load(Ordering::Relaxed)
    }

    /// Take the most recent undefined-frame error, if any.
    pub fn take_protocol_fault(&self) -> Option<CodecError> {
        lock(&self.inner.last_fault).take()
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        self.status.borrow().shutdown
    }

    fn is_ready(&self) -> bool {
        self.status.borrow().ready
    }

    async fn wait_until_ready(&self) -> Result<(), ConnectionError> {
        let mut status = self.status.subscribe();
        let status = status
            .wait_for(|s| s.ready || s.shutdown)
            .await
            .map_err(|_| ConnectionError::UnreachableHost)?;
        if status.shutdown {
            return Err(ConnectionError::UnreachableHost);
        }
        Ok(())
    }

    fn mark_ready(&self) {
        let changed = self.status.send_if_modified(|status| {
            let changed = !status.ready && !status.shutdown;
            status.ready |= changed;
            changed
        });
        if changed {
            tracing::info!(
                connection_id = %self.id,
                peer_addr = %self.peer,
                role = self.role.as_str(),
                "Handshake complete"
            );
        }
    }

    async fn send(&self, frame: Bytes, kind: &'static str) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ConnectionError::UnreachableHost)?;
        match sink.send(frame).await {
            Ok(()) => {
                metrics::record_frame_sent(kind);
                Ok(())
            }
            Err(e) => {
                drop(writer);
                tracing::debug!(connection_id = %self.id, error = %e, kind, "Write failed");
                self.shut_down();
                Err(ConnectionError::UnreachableHost)
            }
        }
    }

    /// Decode and route one inbound frame.
    ///
    /// Undefined frames are counted and skipped. Returns the control event
    /// when it is a handshake token the caller must act on.
    fn receive(&self, frame: &[u8]) -> Result<Option<Inbound>, ConnectionError> {
        match self.codec.decode(frame) {
            Ok(event) => {
                metrics::record_frame_received(event.kind());
                self.route(event)
            }
            Err(err) => {
                self.record_fault(err);
                Ok(None)
            }
        }
    }

    fn route(&self, event: Inbound) -> Result<Option<Inbound>, ConnectionError> {
        let ready = self.is_ready();
        let handshake = match event {
            Inbound::Ping => None,
            Inbound::Data(payload) => {
                self.queue.put(payload);
                None
            }
            Inbound::Hello if self.role == Role::ClientSide => {
                return Err(ConnectionError::BadSetup("hello received by a client"));
            }
            Inbound::ServerReady if self.role == Role::ServerSide => {
                return Err(ConnectionError::BadSetup("server-ready received by a server"));
            }
            Inbound::Hello | Inbound::ServerReady if ready => {
                return Err(ConnectionError::BadSetup("handshake token after ready"));
            }
            handshake @ (Inbound::Hello | Inbound::ServerReady) => Some(handshake),
        };
        self.watchdog.reset();
        self.arrivals.notify_waiters();
        Ok(handshake)
    }

    fn record_fault(&self, err: CodecError) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        metrics::record_protocol_fault("undefined_input");
        tracing::warn!(connection_id = %self.id, error = %err, "Discarding undefined frame");
        *lock(&self.last_fault) = Some(err);
    }

    fn shut_down(&self) {
        let first = self.status.send_if_modified(|status| {
            let first = !status.shutdown;
            status.shutdown = true;
            first
        });
        if !first {
            return;
        }

        if let Some(session) = lock(&self.session).take() {
            session.abort();
        }
        self.queue.close();
        self.watchdog.stop();
        self.close_writer();

        tracing::info!(
            connection_id = %self.id,
            peer_addr = %self.peer,
            role = self.role.as_str(),
            "Connection shut down"
        );
        metrics::record_connection_closed(self.role.as_str());

        if let Some(server) = self.notifier.as_ref().and_then(Weak::upgrade) {
            server.notify_disconnection(self.id);
        }
    }

    fn close_writer(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
            return;
        }
        // A write is in flight; close once it lets go.
        let writer = self.writer.clone();
        self.runtime.spawn(async move {
            writer.lock().await.take();
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            session.abort();
        }
        self.queue.close();
        self.watchdog.stop();
    }
}

fn upgrade(weak: &Weak<Inner>) -> Result<Arc<Inner>, ConnectionError> {
    weak.upgrade().ok_or(ConnectionError::UnreachableHost)
}

fn frame(next: Option<Result<BytesMut, std::io::Error>>) -> Result<BytesMut, ConnectionError> {
    match next {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => {
            tracing::debug!(error = %e, "Read failed");
            Err(ConnectionError::UnreachableHost)
        }
        None => Err(ConnectionError::UnreachableHost),
    }
}

async fn run_session(weak: Weak<Inner>, mut frames: FrameReader) {
    let result = drive(&weak, &mut frames).await;
    let Some(inner) = weak.upgrade() else {
        return;
    };
    match result {
        Ok(()) => {}
        Err(ConnectionError::BadSetup(reason)) => {
            metrics::record_protocol_fault("bad_setup");
            tracing::error!(connection_id = %inner.id, peer_addr = %inner.peer, reason, "Protocol violation");
        }
        Err(err @ ConnectionError::HandshakeRejected(_)) => {
            metrics::record_protocol_fault("handshake_rejected");
            tracing::warn!(connection_id = %inner.id, peer_addr = %inner.peer, error = %err, "Handshake failed");
        }
        Err(err) => {
            tracing::debug!(connection_id = %inner.id, error = %err, "Session ended");
        }
    }
    inner.shut_down();
}

async fn drive(weak: &Weak<Inner>, frames: &mut FrameReader) -> Result<(), ConnectionError> {
    let mut status = upgrade(weak)?.status.subscribe();
    let activated = status
        .wait_for(|s| s.active || s.shutdown)
        .await
        .map(|s| !s.shutdown)
        .unwrap_or(false);
    if !activated {
        return Ok(());
    }

    let role = {
        let inner = upgrade(weak)?;
        let expiring = weak.clone();
        inner.watchdog.launch(move || {
            if let Some(inner) = expiring.upgrade() {
                inner.shut_down();
            }
        });
        inner.role
    };

    match role {
        Role::ClientSide => client_handshake(weak, frames).await?,
        Role::ServerSide => server_handshake(weak, frames).await?,
    }

    loop {
        let inner = upgrade(weak)?;
        if inner.is_shut_down() {
            return Ok(());
        }

        inner.send(inner.codec.encode_ping()?, "ping").await?;

        let limit = inner.config.max_reads_per_cycle;
        let mut reads = 0;
        while limit == 0 || reads < limit {
            let Some(next) = frames.next().now_or_never() else {
                break;
            };
            inner.receive(&frame(next)?)?;
            reads += 1;
        }

        let delay = inner.config.cycle_delay();
        drop(inner);
        tokio::time::sleep(delay).await;
    }
}

async fn client_handshake(weak: &Weak<Inner>, frames: &mut FrameReader) -> Result<(), ConnectionError> {
    {
        let inner = upgrade(weak)?;
        inner.send(inner.codec.encode_hello()?, "hello").await?;
    }

    loop {
        let next = frame(frames.next().await)?;
        let inner = upgrade(weak)?;
        if let Some(Inbound::ServerReady) = inner.receive(&next)? {
            inner.mark_ready();
            return Ok(());
        }
    }
}

async fn server_handshake(weak: &Weak<Inner>, frames: &mut FrameReader) -> Result<(), ConnectionError> {
    let next = frame(frames.next().await)?;
    let inner = upgrade(weak)?;
    match inner.codec.decode(&next) {
        Ok(Inbound::Hello) => {
            metrics::record_frame_received(Inbound::Hello.kind());
            inner.watchdog.reset();
            inner.send(inner.codec.encode_server_ready()?, "server_ready").await?;
            inner.mark_ready();
            Ok(())
        }
        Ok(Inbound::ServerReady) => Err(ConnectionError::BadSetup("server-ready received by a server")),
        Ok(other) => Err(ConnectionError::HandshakeRejected(other.kind())),
        Err(err) => {
            inner.record_fault(err);
            Err(ConnectionError::HandshakeRejected("undefined"))
        }
    }
}
