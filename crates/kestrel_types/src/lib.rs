//! Core types for the Kestrel ingestion pipeline.
//!
//! Kestrel watches a set of configured folders and network shares, turns raw
//! discovery into a stream of file events, and hands that stream to a
//! retrying delivery queue. This crate holds the data model shared by every
//! layer: watch targets, file fingerprints, file events, ignore/eligibility
//! filters, and the cooperative cancellation token.

pub mod cancel;
pub mod event;
pub mod path;
pub mod patterns;
pub mod target;

pub use cancel::CancelToken;
pub use event::{EventKind, FileEvent, FileFingerprint};
pub use patterns::{FileFilter, IgnoreSet, PatternError, DEFAULT_IGNORE_PATTERNS};
pub use target::{Credentials, Secret, TargetId, TargetKind, WatchTarget};
