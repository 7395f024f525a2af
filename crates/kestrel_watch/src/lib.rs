//! File discovery across heterogeneous storage backends.
//!
//! Three watcher variants implement one contract (spawn a task, publish
//! [`kestrel_types::FileEvent`]s, stop cooperatively) over three
//! fundamentally different notification models:
//!
//! - [`LocalWatcher`]: native OS change notification with a stability-window
//!   debounce, for local directories.
//! - [`ProtocolPollWatcher`]: timer-driven recursive enumeration through a
//!   [`ShareClient`] connection, for shares with no notification channel.
//! - [`MountedPollWatcher`]: the same poll-and-reconcile algorithm over an
//!   OS mount point, gated on mount health. Native notification over
//!   network mounts is unreliable enough that polling is the only honest
//!   option.
//!
//! Each watcher exclusively owns its per-target [`FileStateCache`]; nothing
//! here shares mutable state across tasks.

pub mod error;
pub mod handle;
pub mod local;
pub mod mounted;
pub mod protocol;
pub mod share;
pub mod state;
pub mod walk;

pub use error::{TransportError, WatchError};
pub use handle::{ticks_missed, WatcherHandle};
pub use local::{LocalWatcher, LocalWatcherConfig};
pub use mounted::MountedPollWatcher;
pub use protocol::{ProtocolPollConfig, ProtocolPollWatcher};
pub use share::{DirShareClient, ShareClient, ShareEntry};
pub use state::{FileStateCache, Observation};
