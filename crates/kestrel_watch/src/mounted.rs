//! Poll-based watcher for OS-mounted network shares.
//!
//! Native notification over a network mount is frequently silent for remote
//! changes, so this watcher reuses the poll-and-reconcile algorithm of the
//! protocol watcher, reading the mount point through ordinary filesystem
//! calls. Before every tick it consults the mount handle: a degraded or
//! disconnected mount skips the tick entirely. An unreachable mount must
//! never read as an empty directory, which would synthesize a delete for
//! every cached path.

use kestrel_ingest::EventPublisher;
use kestrel_mount::MountHandle;
use kestrel_types::{CancelToken, WatchTarget};
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::handle::{ticks_missed, WatcherHandle};
use crate::state::FileStateCache;
use crate::walk::{walk_observations, WalkOutcome};

pub struct MountedPollWatcher {
    target: WatchTarget,
    mount: Arc<MountHandle>,
    cache: FileStateCache,
    publisher: EventPublisher,
}

impl MountedPollWatcher {
    pub fn new(target: WatchTarget, mount: Arc<MountHandle>, publisher: EventPublisher) -> Self {
        Self {
            target,
            mount,
            cache: FileStateCache::new(),
            publisher,
        }
    }

    pub fn spawn(self, cancel: CancelToken) -> WatcherHandle {
        let target_id = self.target.id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(self.run(token));
        WatcherHandle::new(target_id, cancel, task)
    }

    async fn run(mut self, cancel: CancelToken) -> Result<(), WatchError> {
        info!(
            target_id = %self.target.id,
            mount_point = %self.mount.mount_point.display(),
            poll_interval_ms = self.target.poll_interval.as_millis() as u64,
            "mounted poll watcher started"
        );
        let mut timer = tokio::time::interval(self.target.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let status = self.mount.status();
            if !self.mount.is_healthy() {
                info!(
                    target_id = %self.target.id,
                    status = %status,
                    "mount not healthy; scan tick skipped"
                );
                continue;
            }

            let started = Instant::now();
            if !self.tick().await? {
                break;
            }
            let elapsed = started.elapsed();
            let missed = ticks_missed(elapsed, self.target.poll_interval);
            if missed > 0 {
                warn!(
                    target_id = %self.target.id,
                    missed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "scan overran poll interval; skipping missed ticks"
                );
            }
        }

        info!(target_id = %self.target.id, "mounted poll watcher stopped");
        Ok(())
    }

    /// One scan tick. Returns false when the bus has closed.
    async fn tick(&mut self) -> Result<bool, WatchError> {
        let root = self.mount.mount_point.clone();
        let recursive = self.target.recursive;
        let ignore = self.target.ignore.clone();
        let filter = self.target.filter.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            walk_observations(&root, recursive, &ignore, &filter)
        })
        .await
        .map_err(|err| WatchError::Internal(format!("scan task failed: {err}")))?;

        let WalkOutcome {
            observations,
            errors,
        } = outcome;
        if errors > 0 {
            // Part of the tree failed to enumerate; reconciling now would
            // turn the unreadable subtree into false deletes.
            warn!(
                target_id = %self.target.id,
                errors,
                "walk errors during scan; tick discarded"
            );
            return Ok(true);
        }

        let events = self.cache.reconcile(&self.target.id, observations);
        debug!(
            target_id = %self.target.id,
            events = events.len(),
            cached_paths = self.cache.len(),
            "scan tick completed"
        );
        for event in events {
            debug!(
                target_id = %event.target_id,
                kind = %event.kind,
                path = %event.rel_path,
                "event emitted"
            );
            if self.publisher.publish(event).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
