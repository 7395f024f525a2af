//! Watcher error types.

use std::io;

use thiserror::Error;

/// Component-level watcher failure, surfaced to the supervisor through the
/// watcher handle. Transient scan problems never become a `WatchError`; they
/// are absorbed by the per-tick recovery policy.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to subscribe to change notifications for {path}: {source}")]
    Subscribe {
        path: String,
        #[source]
        source: notify::Error,
    },

    #[error("change notification stream failed: {0}")]
    Notification(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("watcher internal failure: {0}")]
    Internal(String),
}

/// Transient transport failure while scanning a share. Handled by the
/// watcher's reconnect policy; never propagates past it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
