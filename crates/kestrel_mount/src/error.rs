//! Mount error taxonomy.
//!
//! A mount failure is fatal for its target until network or configuration
//! conditions change: the target is marked unusable and retried on a long
//! backoff. It never crashes the process or affects other targets.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("authentication rejected for {endpoint}")]
    AuthRejected { endpoint: String },

    #[error("host unreachable: {host}")]
    HostUnreachable { host: String },

    #[error("share not found: {endpoint}")]
    ShareNotFound { endpoint: String },

    #[error("no free mount slot available")]
    NoMountSlotAvailable,

    #[error("share URI not understood: {uri}")]
    InvalidUri { uri: String },

    #[error("{operation} failed: {detail}")]
    CommandFailed { operation: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
