//! Kestrel: watch folders and shares, deliver every file change downstream.
//!
//! The binary wires the library crates together: configuration decides which
//! watcher variant each target gets, the pipeline supervises the tasks, and
//! the JSONL sink is the default downstream processor.

pub mod config;
pub mod pipeline;
pub mod sink;

pub use config::{Config, ConfigError};
pub use pipeline::{Pipeline, ShutdownOutcome};
pub use sink::JsonlSink;
