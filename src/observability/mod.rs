//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connections, sessions and the server produce:
//!     → logging.rs (structured tracing events with connection_id / peer_addr)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout via tracing-subscriber fmt layer
//!     → Prometheus scrape endpoint (optional)
//! ```

pub mod logging;
pub mod metrics;
