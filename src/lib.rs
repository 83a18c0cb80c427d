//! warp_client - Rust session core for the Mini WARP terminal client
//!
//! Modules:
//! - session: WebSocket-backed connection session (connect/disconnect/on/send)
//! - events: Event registry with ordered callback dispatch
//! - shutdown: Process-wide lifecycle manager (signal handling, exit teardown)
//! - config: Session configuration with user overlay and env overrides
//! - metrics: Per-session message and dispatch counters
//! - error: Client error taxonomy

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod session;
pub mod shutdown;

// Re-export key types for convenience
pub use config::SessionConfig;
pub use error::ClientError;
pub use events::{DispatchOutcome, EventRegistry};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use session::{ConnectionState, ConnectionStatus, WarpSession};
