//! Per-connection application logic.
//!
//! The server builds one handler per accepted connection through a
//! [`HandlerFactory`], binds it with [`ConnectionHandler::set_connection`] and
//! runs [`ConnectionHandler::run`] on its own task next to the session.

use async_trait::async_trait;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::net::Connection;

/// Application logic bound to one server-side connection.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once, before `run`.
    fn set_connection(&self, connection: Connection);

    /// Drive the connection. Usually ends by calling `connection.shutdown()`.
    async fn run(&self);

    /// Called by the server during teardown.
    fn shutdown(&self);
}

/// Errors building a handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerFactoryError {
    #[error("handler type has no default constructor")]
    NoDefaultConstructor,

    #[error("handler constructor is not accessible")]
    ConstructorInaccessible,

    #[error("handler type cannot be instantiated")]
    NotInstantiable,

    #[error("handler constructor failed: {0}")]
    ConstructorFailed(String),
}

/// Builds a fresh handler for each accepted connection.
pub type HandlerFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ConnectionHandler>, HandlerFactoryError> + Send + Sync>;

/// Factory for any `Default` handler type.
pub fn default_factory<H>() -> HandlerFactory
where
    H: ConnectionHandler + Default,
{
    Arc::new(|| Ok(Arc::new(H::default()) as Arc<dyn ConnectionHandler>))
}

/// Factory from a fallible constructor.
pub fn factory_fn<H, F>(build: F) -> HandlerFactory
where
    H: ConnectionHandler,
    F: Fn() -> Result<H, HandlerFactoryError> + Send + Sync + 'static,
{
    Arc::new(move || build().map(|handler| Arc::new(handler) as Arc<dyn ConnectionHandler>))
}

/// Run the factory, turning a panic into [`HandlerFactoryError::ConstructorFailed`].
pub(crate) fn instantiate(
    factory: &HandlerFactory,
) -> Result<Arc<dyn ConnectionHandler>, HandlerFactoryError> {
    panic::catch_unwind(AssertUnwindSafe(|| factory()))
        .unwrap_or_else(|payload| Err(HandlerFactoryError::ConstructorFailed(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "constructor panicked".to_string()
    }
}

/// Writes every payload back to the peer until the connection ends.
#[derive(Debug, Default)]
pub struct EchoHandler {
    connection: OnceLock<Connection>,
}

#[async_trait]
impl ConnectionHandler for EchoHandler {
    fn set_connection(&self, connection: Connection) {
        if self.connection.set(connection).is_err() {
            tracing::warn!("Echo handler already bound");
        }
    }

    async fn run(&self) {
        let Some(connection) = self.connection.get() else {
            tracing::warn!("Echo handler started without a connection");
            return;
        };

        loop {
            let payload = match connection.read().await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::debug!(connection_id = %connection.id(), error = %e, "Echo read ended");
                    break;
                }
            };
            if let Err(e) = connection.write(&payload).await {
                tracing::debug!(connection_id = %connection.id(), error = %e, "Echo write failed");
                break;
            }
        }
        connection.shutdown();
    }

    fn shutdown(&self) {
        if let Some(connection) = self.connection.get() {
            connection.shutdown();
        }
    }
}
