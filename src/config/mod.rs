//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize, or defaults when the file is absent)
//!     → validation.rs (semantic checks)
//!     → Settings (validated, immutable)
//!     → passed explicitly into MessageCodec, Connection and Server constructors
//! ```
//!
//! Config is loaded once per process; there is no global instance.
//! All fields have defaults to allow minimal configs.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_or_default, ConfigError, ConfigSource};
pub use schema::CodecConfig;
pub use schema::ConnectionConfig;
pub use schema::ObservabilityConfig;
pub use schema::ServerConfig;
pub use schema::Settings;
pub use validation::{validate_codec, validate_config, validate_connection, ValidationError};
