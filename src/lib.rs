//! Connection-oriented messaging over TCP.
//!
//! A [`Server`] accepts links and binds one [`ConnectionHandler`] to each; a
//! client dials with [`Connection::connect`]. Both ends run a hello /
//! server-ready handshake, then exchange pings and tagged data frames.

pub mod config;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod server;

pub use config::Settings;
pub use net::{Connection, ConnectionError, ConnectionId};
pub use protocol::{Charset, Cipher, MessageCodec};
pub use server::{default_factory, factory_fn, ConnectionHandler, EchoHandler, Server, ServerError, ServerStatus};
