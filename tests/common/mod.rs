//! Shared utilities for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use socket_link::config::CodecConfig;
use socket_link::protocol::{Inbound, MessageCodec};
use socket_link::server::{factory_fn, HandlerFactory};
use socket_link::{Connection, ConnectionHandler, Server, Settings};

/// Settings with short delays so tests run quickly.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.server.bind_host = "127.0.0.1".into();
    settings.server.accept_delay_ms = 5;
    settings.server.drain_timeout_ms = 2_000;
    settings.connection.cycle_delay_ms = 10;
    settings.connection.ttl_secs = 5;
    settings
}

pub fn addr_of(server: &Server) -> String {
    format!("127.0.0.1:{}", server.port())
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `fut` with a generous upper bound so a hang fails the test.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("operation timed out")
}

/// What the capturing handlers saw, shared across every handler instance.
#[derive(Default)]
pub struct Probe {
    pub connections: Mutex<Vec<Connection>>,
    pub shutdowns: AtomicUsize,
}

impl Probe {
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Connection {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// Handler that hands its connection to the test and otherwise does nothing.
pub struct CapturingHandler {
    probe: Arc<Probe>,
    connection: OnceLock<Connection>,
}

#[async_trait]
impl ConnectionHandler for CapturingHandler {
    fn set_connection(&self, connection: Connection) {
        self.probe.connections.lock().unwrap().push(connection.clone());
        let _ = self.connection.set(connection);
    }

    async fn run(&self) {}

    fn shutdown(&self) {
        self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = self.connection.get() {
            connection.shutdown();
        }
    }
}

pub fn capturing_factory(probe: Arc<Probe>) -> HandlerFactory {
    factory_fn(move || {
        Ok(CapturingHandler {
            probe: probe.clone(),
            connection: OnceLock::new(),
        })
    })
}

pub type RawPeer = Framed<TcpStream, LengthDelimitedCodec>;

/// Plain TCP peer speaking the wire format by hand.
pub async fn raw_connect(addr: &str) -> RawPeer {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub fn default_codec() -> MessageCodec {
    MessageCodec::new(CodecConfig::default())
}

/// Next non-ping event, or `None` once the other end has closed.
pub async fn next_event(peer: &mut RawPeer, codec: &MessageCodec) -> Option<Inbound> {
    loop {
        let frame = match peer.next().await? {
            Ok(frame) => frame,
            Err(_) => return None,
        };
        match codec.decode(&frame).unwrap() {
            Inbound::Ping => continue,
            event => return Some(event),
        }
    }
}

/// Run the client half of the handshake over a raw peer.
pub async fn raw_handshake(peer: &mut RawPeer, codec: &MessageCodec) {
    peer.send(codec.encode_hello().unwrap()).await.unwrap();
    assert_eq!(next_event(peer, codec).await, Some(Inbound::ServerReady));
}

/// `true` once the other end has closed the stream.
pub async fn closed_by_peer(peer: &mut RawPeer, codec: &MessageCodec) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        while next_event(peer, codec).await.is_some() {}
    })
    .await
    .is_ok()
}
