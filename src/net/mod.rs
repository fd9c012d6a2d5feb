//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Client: Connection::connect ─┐
//! Server: listener.rs accept ──┴─▶ connection.rs (split stream, spawn session)
//!                                     → handshake (hello / server-ready)
//!                                     → session loop (ping, drain, sleep)
//!                                     → queue.rs (decoded payloads for read)
//!                                     → watchdog.rs (silence ≥ TTL ⇒ shutdown)
//! ```
//!
//! # Design Decisions
//! - One session task per connection is the only reader of its stream
//! - Writes share one async lock per connection
//! - Status bits live in a watch channel so waiters park without polling

pub mod connection;
pub mod listener;
pub mod queue;
pub mod watchdog;

pub use connection::{Connection, ConnectionError, ConnectionId, DisconnectNotifier, Role};
pub use listener::{Listener, ListenerError};
pub use queue::{InboundQueue, QueueError};
pub use watchdog::Watchdog;
