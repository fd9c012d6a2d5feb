//! Server accept loop and lifecycle.
//!
//! # Status
//! ```text
//! WaitingLaunch ──start──▶ Running ◀──open / close──▶ Closed
//!                             │                         │
//!                             └────────shutdown─────────┴──▶ ShutDown
//! ```
//! `ShutDown` is terminal. `close` only stops accepting; registered
//! connections keep running until they end or the server shuts down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, Settings};
use crate::net::{Connection, ConnectionId, DisconnectNotifier, Listener, ListenerError};
use crate::observability::metrics;
use crate::protocol::MessageCodec;
use crate::server::handler::{instantiate, ConnectionHandler, HandlerFactory, HandlerFactoryError};
use crate::server::registry::ConnectionRegistry;
use crate::server::workers::WorkerPool;

/// Lifecycle status of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Bound but the accept loop has not started.
    WaitingLaunch,
    /// Accepting connections.
    Running,
    /// Not accepting; existing connections live on.
    Closed,
    /// Terminal.
    ShutDown,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::WaitingLaunch => "waiting_launch",
            ServerStatus::Running => "running",
            ServerStatus::Closed => "closed",
            ServerStatus::ShutDown => "shut_down",
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Bind(#[source] ListenerError),

    #[error("server is shut down")]
    ServerShutdown,

    #[error("server is already closed")]
    ServerAlreadyClosed,

    #[error("server is already open")]
    ServerAlreadyOpened,

    #[error(transparent)]
    Handler(#[from] HandlerFactoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

struct ServerState {
    status: ServerStatus,
    started: bool,
    listener: Option<Arc<Listener>>,
    /// The accept loop holds a listener clone.
    accepting: bool,
}

struct ServerShared {
    port: u16,
    state: watch::Sender<ServerState>,
    registry: ConnectionRegistry,
    workers: WorkerPool,
    factory: HandlerFactory,
    settings: Settings,
    codec: Arc<MessageCodec>,
}

/// Accepts connections and runs one handler per connection.
pub struct Server {
    shared: Arc<ServerShared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(port: u16, status: ServerStatus) {
    tracing::info!(port, status = status.as_str(), "Server status changed");
    metrics::record_server_transition(status.as_str());
}

impl Server {
    /// Bind `port` (0 picks a free one) with a codec built from `settings`.
    ///
    /// The factory is exercised once up front so a broken factory fails here.
    /// The accept loop starts immediately unless `server.manual_start` is set.
    pub async fn bind(port: u16, factory: HandlerFactory, settings: &Settings) -> Result<Self, ServerError> {
        let codec = Arc::new(MessageCodec::new(settings.codec.clone()));
        Self::bind_with_codec(port, factory, settings, codec).await
    }

    /// Like [`bind`](Server::bind) with an explicit codec, e.g. one carrying a cipher.
    pub async fn bind_with_codec(
        port: u16,
        factory: HandlerFactory,
        settings: &Settings,
        codec: Arc<MessageCodec>,
    ) -> Result<Self, ServerError> {
        validate_config(settings).map_err(ConfigError::Validation)?;
        instantiate(&factory)?;

        let listener = Listener::bind(&settings.server.bind_host, port)
            .await
            .map_err(ServerError::Bind)?;

        let port = listener.port();
        let (state, _) = watch::channel(ServerState {
            status: ServerStatus::WaitingLaunch,
            started: false,
            listener: Some(Arc::new(listener)),
            accepting: false,
        });
        let shared = Arc::new(ServerShared {
            port,
            state,
            registry: ConnectionRegistry::new(),
            workers: WorkerPool::new(settings.server.worker_pool_size),
            factory,
            settings: settings.clone(),
            codec,
        });
        let server = Self {
            shared,
            accept_task: Mutex::new(None),
        };
        if !settings.server.manual_start {
            server.start()?;
        }
        Ok(server)
    }

    /// Start the accept loop. Later calls are no-ops.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut outcome = Ok(());
        let started = self.shared.state.send_if_modified(|state| {
            if state.status == ServerStatus::ShutDown {
                outcome = Err(ServerError::ServerShutdown);
                return false;
            }
            if state.started {
                return false;
            }
            state.started = true;
            if state.status == ServerStatus::WaitingLaunch {
                state.status = ServerStatus::Running;
            }
            true
        });
        outcome?;

        if started {
            transition(self.shared.port, self.status());
            let task = tokio::spawn(accept_loop(self.shared.clone()));
            *lock(&self.accept_task) = Some(task);
        }
        Ok(())
    }

    /// Stop accepting. Registered connections are left alone.
    pub async fn close(&self) -> Result<(), ServerError> {
        let mut outcome = Ok(());
        self.shared.state.send_if_modified(|state| match state.status {
            ServerStatus::ShutDown => {
                outcome = Err(ServerError::ServerShutdown);
                false
            }
            ServerStatus::Closed => {
                outcome = Err(ServerError::ServerAlreadyClosed);
                false
            }
            ServerStatus::WaitingLaunch | ServerStatus::Running => {
                state.listener = None;
                state.status = ServerStatus::Closed;
                true
            }
        });
        outcome?;
        transition(self.shared.port, ServerStatus::Closed);

        // The port is free once the accept loop lets go of its listener.
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| !state.accepting).await;
        Ok(())
    }

    /// Re-bind the same port and resume accepting.
    pub async fn open(&self) -> Result<(), ServerError> {
        {
            let state = self.shared.state.borrow();
            if state.status == ServerStatus::ShutDown {
                return Err(ServerError::ServerShutdown);
            }
            if state.listener.is_some() {
                return Err(ServerError::ServerAlreadyOpened);
            }
        }

        let listener = Listener::bind(&self.shared.settings.server.bind_host, self.shared.port)
            .await
            .map_err(ServerError::Bind)?;

        let mut outcome = Ok(());
        self.shared.state.send_if_modified(|state| {
            if state.status == ServerStatus::ShutDown {
                outcome = Err(ServerError::ServerShutdown);
                return false;
            }
            if state.listener.is_some() {
                outcome = Err(ServerError::ServerAlreadyOpened);
                return false;
            }
            state.listener = Some(Arc::new(listener));
            state.status = ServerStatus::Running;
            true
        });
        outcome?;
        transition(self.shared.port, self.status());
        Ok(())
    }

    /// Stop accepting, shut down every registered connection and wait for
    /// deregistration to drain.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        if !self.shared.mark_shut_down() {
            return Err(ServerError::ServerShutdown);
        }

        let task = lock(&self.accept_task).take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    tracing::error!(port = self.shared.port, error = %e, "Accept loop failed");
                }
            }
            None => self.shared.teardown().await,
        }
        Ok(())
    }

    /// `WaitingLaunch` until started, then the current status.
    pub fn status(&self) -> ServerStatus {
        let state = self.shared.state.borrow();
        match state.status {
            ServerStatus::ShutDown => ServerStatus::ShutDown,
            _ if !state.started => ServerStatus::WaitingLaunch,
            status => status,
        }
    }

    /// Registered connections not yet deregistered.
    pub fn active_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Address of the current listener, if open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .state
            .borrow()
            .listener
            .as_ref()
            .map(|listener| listener.local_addr())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.shared.port)
            .field("status", &self.status())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.mark_shut_down();
    }
}

impl ServerShared {
    fn status(&self) -> ServerStatus {
        self.state.borrow().status
    }

    /// Move to `ShutDown`. Returns `false` if already there.
    fn mark_shut_down(&self) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.status == ServerStatus::ShutDown {
                return false;
            }
            state.status = ServerStatus::ShutDown;
            state.listener = None;
            true
        });
        if changed {
            transition(self.port, ServerStatus::ShutDown);
        }
        changed
    }

    /// Clone the listener out of the state while running.
    fn checkout_listener(&self) -> Option<Arc<Listener>> {
        let mut listener = None;
        self.state.send_if_modified(|state| {
            if state.status != ServerStatus::Running {
                return false;
            }
            listener = state.listener.clone();
            state.accepting = listener.is_some();
            state.accepting
        });
        listener
    }

    fn release_listener(&self) {
        self.state.send_if_modified(|state| std::mem::replace(&mut state.accepting, false));
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, handler: Arc<dyn ConnectionHandler>) {
        let shared = Arc::downgrade(self);
        let notifier: Weak<dyn DisconnectNotifier> = shared;
        let connection = Connection::accepted(
            stream,
            peer,
            self.settings.connection.clone(),
            self.codec.clone(),
            notifier,
        );

        self.registry.insert(connection.clone(), handler.clone());
        connection.activate();
        handler.set_connection(connection);
        tokio::spawn(async move { handler.run().await });
    }

    async fn teardown(&self) {
        let closed = self.registry.shutdown_all();
        let drained = self.workers.drain(self.settings.server.drain_timeout()).await;
        tracing::info!(port = self.port, connections = closed, drained, "Server torn down");
    }
}

impl DisconnectNotifier for ServerShared {
    fn notify_disconnection(&self, id: ConnectionId) {
        let registry = self.registry.clone();
        self.workers.submit(async move {
            if let Err(e) = registry.remove(id) {
                tracing::error!(error = %e, "Deregistration failed");
            }
        });
    }
}

/// Wait until the status leaves `from`; reports the new status.
async fn status_change(state: &mut watch::Receiver<ServerState>, from: ServerStatus) -> ServerStatus {
    match state.wait_for(|state| state.status != from).await {
        Ok(state) => state.status,
        Err(_) => ServerStatus::ShutDown,
    }
}

async fn accept_loop(shared: Arc<ServerShared>) {
    let mut state = shared.state.subscribe();
    let port = shared.port;
    tracing::info!(port, "Accept loop started");

    while shared.status() != ServerStatus::ShutDown {
        tokio::time::sleep(shared.settings.server.accept_delay()).await;

        if shared.status() == ServerStatus::Closed {
            tracing::debug!(port, "Accept loop parked");
            if status_change(&mut state, ServerStatus::Closed).await == ServerStatus::ShutDown {
                break;
            }
            continue;
        }

        let handler = match instantiate(&shared.factory) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(port, error = %e, "Handler construction failed");
                shared.mark_shut_down();
                break;
            }
        };

        let Some(listener) = shared.checkout_listener() else {
            continue;
        };
        let accepted = tokio::select! {
            accepted = listener.accept() => Some(accepted),
            _ = status_change(&mut state, ServerStatus::Running) => None,
        };
        drop(listener);
        shared.release_listener();

        match accepted {
            Some(Ok((stream, peer))) => shared.admit(stream, peer, handler),
            Some(Err(e)) if shared.status() == ServerStatus::Running => {
                tracing::error!(port, error = %e, "Listener fault");
                shared.mark_shut_down();
                break;
            }
            // Closed or shut down mid-accept.
            Some(Err(_)) | None => {}
        }
    }

    shared.teardown().await;
    tracing::info!(port, "Accept loop stopped");
}
