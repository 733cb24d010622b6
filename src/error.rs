//! Error types for the harness.

use thiserror::Error;

/// Errors raised by connections, channels and pool runs.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The transport could not establish a connection.
    #[error("failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Read or write failure on an established connection.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The channel closed while a read was pending or before it was issued.
    #[error("connection closed")]
    Disconnected,

    /// A per-connection routine panicked or was cancelled.
    #[error("connection task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias using HarnessError.
pub type Result<T> = std::result::Result<T, HarnessError>;
