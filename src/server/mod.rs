//! Server subsystem.
//!
//! # Data Flow
//! ```text
//! host.rs accept loop
//!     → handler.rs (factory builds a fresh ConnectionHandler)
//!     → net::Connection (server side, parked)
//!     → registry.rs (insert connection + handler)
//!     → activate, bind handler, spawn handler.run()
//!
//! Connection::shutdown
//!     → DisconnectNotifier → workers.rs (deferred registry removal)
//! ```
//!
//! # Design Decisions
//! - Status and listener live in one watch channel; waiters park on it
//! - Deregistration never runs on the caller's task
//! - Teardown shuts down every registered connection, then drains the pool

pub mod handler;
pub mod host;
pub mod registry;
pub mod workers;

pub use handler::{
    default_factory, factory_fn, ConnectionHandler, EchoHandler, HandlerFactory, HandlerFactoryError,
};
pub use host::{Server, ServerError, ServerStatus};
pub use registry::{ConnectionRegistry, RegistryError};
pub use workers::WorkerPool;
