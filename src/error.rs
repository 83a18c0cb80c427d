// warp_client/src/error.rs
// Error taxonomy for the session core

use thiserror::Error;

/// Errors surfaced by the public session operations.
///
/// Only `connect` and `send` are fallible. Teardown and event dispatch
/// swallow their internal failures after a best-effort log attempt.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint could not be reached (TCP/handshake failure or timeout).
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint rejected the supplied credentials during the handshake.
    #[error("authentication rejected by endpoint (HTTP {status})")]
    AuthRejected { status: u16 },

    /// The endpoint URL is not a usable ws:// or wss:// URL.
    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),

    /// The operation requires a live connection.
    #[error("session is not connected")]
    NotConnected,

    /// `connect` was called while a connection is already active.
    #[error("session already connected")]
    AlreadyConnected,

    /// The session has been torn down and cannot be reused.
    #[error("session has been torn down")]
    SessionClosed,
}
