//! # HTTP Middleware
//!
//! Cross-cutting concerns applied to every request:
//! - **RequestLogging**: structured start/finish lines via `tracing`
//! - **MetricsMiddleware**: per-endpoint counters into [`crate::state::AppState`]
//!
//! WebSocket upgrades pass through both like any other request; only the
//! upgrade handshake itself is measured, not the lifetime of the socket.

pub mod logging;
pub mod metrics;

pub use logging::RequestLogging;
pub use metrics::MetricsMiddleware;
