//! OS-level mount lifecycle for network shares.
//!
//! The [`MountManager`] establishes, health-checks, and tears down OS
//! mappings of network shares to local mount points. It is the only writer
//! of mount state; watchers hold read references to [`MountHandle`]s and
//! pause their scan ticks whenever a mount is not healthy.
//!
//! The actual `mount`/`net use` shell-outs live behind the [`Mounter`]
//! trait, so the manager logic is exercised against a fake mount table in
//! tests and the platform differences stay in one file.

pub mod error;
pub mod manager;
pub mod mounter;

pub use error::MountError;
pub use manager::{MountHandle, MountManager, MountManagerConfig, MountStatus};
pub use mounter::{MountRequest, MountTableEntry, Mounter, ShellMounter};
