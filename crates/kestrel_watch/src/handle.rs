//! Running-watcher handle and tick bookkeeping.

use kestrel_types::{CancelToken, TargetId};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::WatchError;

/// Handle to a spawned watcher task.
///
/// Stopping is cooperative: a watcher mid-tick finishes that tick (and never
/// emits a partial tick's events) before exiting. A watcher that failed,
/// e.g. on a broken notification subscription, reports the failure through
/// [`WatcherHandle::join`]; it never dies silently.
pub struct WatcherHandle {
    target_id: TargetId,
    cancel: CancelToken,
    task: JoinHandle<Result<(), WatchError>>,
}

impl WatcherHandle {
    pub fn new(
        target_id: TargetId,
        cancel: CancelToken,
        task: JoinHandle<Result<(), WatchError>>,
    ) -> Self {
        Self {
            target_id,
            cancel,
            task,
        }
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    /// Request cooperative stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the watcher task to finish and surface its outcome.
    pub async fn join(self) -> Result<(), WatchError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(WatchError::Internal(format!("watcher task panicked: {err}"))),
        }
    }
}

/// How many scheduled ticks elapsed while a scan overran its interval.
///
/// A scan slower than the poll interval causes the overlapping ticks to be
/// skipped (logged, never queued), so two scans of one target can never run
/// concurrently and a slow network cannot build an unbounded backlog.
pub fn ticks_missed(scan_elapsed: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }
    (scan_elapsed.as_millis() / interval.as_millis()) as u32
}
