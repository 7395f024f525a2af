//! Native-notification watcher for local directories.
//!
//! Raw OS notifications are too chatty to forward directly: a single copy
//! produces dozens of write events, and a half-written file must not be
//! handed downstream. Every notification therefore parks its path in a
//! pending set, and a sweep emits the add/change only once the path's
//! size/mtime has stopped moving for the stability window. Deletes are
//! emitted immediately for paths the cache knows.
//!
//! On start the watcher walks the tree once, emitting adds for files that
//! already exist and seeding the cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kestrel_ingest::EventPublisher;
use kestrel_types::path::normalize_rel_path;
use kestrel_types::{CancelToken, FileEvent, FileFingerprint, WatchTarget};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WatchError;
use crate::handle::WatcherHandle;
use crate::state::FileStateCache;
use crate::walk::walk_observations;

#[derive(Debug, Clone)]
pub struct LocalWatcherConfig {
    /// A path must hold still this long before its event is emitted.
    pub stability_window: Duration,
    /// Cadence of the sweep that re-examines pending paths.
    pub sweep_interval: Duration,
}

impl Default for LocalWatcherConfig {
    fn default() -> Self {
        Self {
            stability_window: Duration::from_secs(2),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

/// A path waiting out its stability window.
struct PendingChange {
    abs_path: PathBuf,
    fingerprint: Option<FileFingerprint>,
    last_movement: Instant,
}

pub struct LocalWatcher {
    target: WatchTarget,
    publisher: EventPublisher,
    config: LocalWatcherConfig,
    cache: FileStateCache,
}

impl LocalWatcher {
    pub fn new(target: WatchTarget, publisher: EventPublisher, config: LocalWatcherConfig) -> Self {
        Self {
            target,
            publisher,
            config,
            cache: FileStateCache::new(),
        }
    }

    pub fn spawn(self, cancel: CancelToken) -> WatcherHandle {
        let target_id = self.target.id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(self.run(token));
        WatcherHandle::new(target_id, cancel, task)
    }

    async fn run(mut self, cancel: CancelToken) -> Result<(), WatchError> {
        let root = PathBuf::from(&self.target.uri);
        info!(
            target_id = %self.target.id,
            path = %root.display(),
            recursive = self.target.recursive,
            "local watcher started"
        );

        // Bridge notify's callback thread into the task.
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                let _ = raw_tx.send(result);
            })
            .map_err(|source| WatchError::Subscribe {
                path: root.display().to_string(),
                source,
            })?;
        let mode = if self.target.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&root, mode)
            .map_err(|source| WatchError::Subscribe {
                path: root.display().to_string(),
                source,
            })?;

        // Existing files are adds: scan once and seed the cache.
        if !self.initial_scan(&root).await {
            return Ok(());
        }

        let mut pending: HashMap<String, PendingChange> = HashMap::new();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => {
                        if !self.handle_notification(&root, event, &mut pending).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        // Subscription is broken; surface instead of dying
                        // silently.
                        error!(
                            target_id = %self.target.id,
                            error = %err,
                            "change notification stream failed"
                        );
                        return Err(WatchError::Notification(err));
                    }
                    None => {
                        return Err(WatchError::Internal(
                            "notification channel closed unexpectedly".to_string(),
                        ));
                    }
                },
                _ = sweep.tick() => {
                    if !self.sweep_pending(&mut pending).await {
                        break;
                    }
                }
            }
        }

        info!(target_id = %self.target.id, "local watcher stopped");
        Ok(())
    }

    /// Walk existing files and publish their adds. Returns false when the
    /// bus has closed.
    async fn initial_scan(&mut self, root: &Path) -> bool {
        let walk_root = root.to_path_buf();
        let recursive = self.target.recursive;
        let ignore = self.target.ignore.clone();
        let filter = self.target.filter.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            walk_observations(&walk_root, recursive, &ignore, &filter)
        })
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target_id = %self.target.id, error = %err, "initial scan failed");
                return true;
            }
        };
        let events = self.cache.reconcile(&self.target.id, outcome.observations);
        debug!(
            target_id = %self.target.id,
            existing = events.len(),
            "initial scan complete"
        );
        self.publish_all(events).await
    }

    /// Fold one raw notification into the pending set. Deletes go straight
    /// out; everything else waits for stability.
    async fn handle_notification(
        &mut self,
        root: &Path,
        event: notify::Event,
        pending: &mut HashMap<String, PendingChange>,
    ) -> bool {
        if matches!(event.kind, notify::EventKind::Access(_)) {
            return true;
        }
        for abs_path in event.paths {
            let Ok(rel) = abs_path.strip_prefix(root) else {
                continue;
            };
            let rel_path = normalize_rel_path(rel);
            if rel_path.is_empty() || self.target.ignore.is_ignored(&rel_path) {
                continue;
            }

            match tokio::fs::metadata(&abs_path).await {
                Ok(metadata) if metadata.is_file() => {
                    if !self.target.filter.allows(&rel_path, Some(metadata.len())) {
                        debug!(
                            target_id = %self.target.id,
                            path = %rel_path,
                            "file skipped by eligibility filter"
                        );
                        continue;
                    }
                    let entry = pending.entry(rel_path).or_insert_with(|| PendingChange {
                        abs_path: abs_path.clone(),
                        fingerprint: None,
                        last_movement: Instant::now(),
                    });
                    let fingerprint = FileFingerprint::from_metadata(&metadata);
                    if entry.fingerprint != fingerprint {
                        entry.fingerprint = fingerprint;
                        entry.last_movement = Instant::now();
                    }
                }
                Ok(_) => {
                    // Directory events carry no file payload; children
                    // arrive as their own notifications.
                }
                Err(_) => {
                    // Path is gone. A known path becomes a delete now.
                    pending.remove(&rel_path);
                    if self.cache.remove(&rel_path) {
                        let event = FileEvent::deleted(self.target.id.clone(), rel_path);
                        if !self.publish_all(vec![event]).await {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Emit events for pending paths whose fingerprints have held still for
    /// the stability window.
    async fn sweep_pending(&mut self, pending: &mut HashMap<String, PendingChange>) -> bool {
        let now = Instant::now();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, change)| now.duration_since(change.last_movement) >= self.config.stability_window)
            .map(|(rel_path, _)| rel_path.clone())
            .collect();

        for rel_path in due {
            let Some(change) = pending.remove(&rel_path) else {
                continue;
            };
            match tokio::fs::metadata(&change.abs_path).await {
                Ok(metadata) => {
                    let current = FileFingerprint::from_metadata(&metadata);
                    if current != change.fingerprint {
                        // Still moving: rearm the window with what we saw.
                        pending.insert(
                            rel_path,
                            PendingChange {
                                abs_path: change.abs_path,
                                fingerprint: current,
                                last_movement: Instant::now(),
                            },
                        );
                        continue;
                    }
                    let Some(fingerprint) = current else {
                        continue;
                    };
                    let event = match self.cache.get(&rel_path) {
                        None => Some(FileEvent::added(
                            self.target.id.clone(),
                            rel_path.clone(),
                            fingerprint,
                        )),
                        Some(previous) if *previous != fingerprint => Some(FileEvent::changed(
                            self.target.id.clone(),
                            rel_path.clone(),
                            fingerprint,
                        )),
                        Some(_) => None,
                    };
                    self.cache.insert(rel_path, fingerprint);
                    if let Some(event) = event {
                        debug!(
                            target_id = %event.target_id,
                            kind = %event.kind,
                            path = %event.rel_path,
                            "event emitted"
                        );
                        if !self.publish_all(vec![event]).await {
                            return false;
                        }
                    }
                }
                Err(_) => {
                    if self.cache.remove(&rel_path) {
                        let event = FileEvent::deleted(self.target.id.clone(), rel_path);
                        if !self.publish_all(vec![event]).await {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Publish events in order; false when the bus has closed (shutdown).
    async fn publish_all(&self, events: Vec<FileEvent>) -> bool {
        for event in events {
            if self.publisher.publish(event).await.is_err() {
                debug!(target_id = %self.target.id, "event bus closed; stopping");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ingest::{DedupConfig, EventBus};
    use kestrel_types::EventKind;

    fn quick_config() -> LocalWatcherConfig {
        LocalWatcherConfig {
            stability_window: Duration::from_millis(150),
            sweep_interval: Duration::from_millis(40),
        }
    }

    async fn recv_kind(
        rx: &mut mpsc::Receiver<FileEvent>,
        timeout: Duration,
    ) -> Option<FileEvent> {
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn existing_files_surface_as_adds() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pre.txt"), b"seed").unwrap();

        let mut bus = EventBus::new(64, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let target = WatchTarget::local("l1", dir.path().to_string_lossy());
        let watcher = LocalWatcher::new(target, bus.publisher(), quick_config());
        let cancel = CancelToken::new();
        let handle = watcher.spawn(cancel);

        let event = recv_kind(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.kind, EventKind::Add);
        assert_eq!(event.rel_path, "pre.txt");

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn written_file_debounces_into_one_add() {
        let dir = tempfile::tempdir().unwrap();
        let mut bus = EventBus::new(64, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let target = WatchTarget::local("l1", dir.path().to_string_lossy());
        let watcher = LocalWatcher::new(target, bus.publisher(), quick_config());
        let handle = watcher.spawn(CancelToken::new());

        // Several rapid writes to the same path.
        tokio::time::sleep(Duration::from_millis(50)).await;
        for chunk in 1..=3u8 {
            std::fs::write(dir.path().join("grow.txt"), vec![b'x'; chunk as usize * 10]).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let event = recv_kind(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.kind, EventKind::Add);
        assert_eq!(event.rel_path, "grow.txt");
        assert_eq!(event.fingerprint.unwrap().size_bytes, 30);

        // The burst collapsed: no further event follows.
        assert!(recv_kind(&mut rx, Duration::from_millis(400)).await.is_none());

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn delete_of_known_file_is_emitted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doomed.txt"), b"bye").unwrap();

        let mut bus = EventBus::new(64, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let target = WatchTarget::local("l1", dir.path().to_string_lossy());
        let watcher = LocalWatcher::new(target, bus.publisher(), quick_config());
        let handle = watcher.spawn(CancelToken::new());

        let add = recv_kind(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(add.kind, EventKind::Add);

        std::fs::remove_file(dir.path().join("doomed.txt")).unwrap();
        let delete = recv_kind(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert_eq!(delete.rel_path, "doomed.txt");
        assert!(delete.fingerprint.is_none());

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn ignored_paths_never_surface() {
        let dir = tempfile::tempdir().unwrap();
        let mut bus = EventBus::new(64, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let mut target = WatchTarget::local("l1", dir.path().to_string_lossy());
        target.ignore = kestrel_types::IgnoreSet::compile(["*.tmp"]).unwrap();
        let watcher = LocalWatcher::new(target, bus.publisher(), quick_config());
        let handle = watcher.spawn(CancelToken::new());

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("scratch.tmp"), b"junk").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"data").unwrap();

        let event = recv_kind(&mut rx, Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.rel_path, "real.txt");
        assert!(recv_kind(&mut rx, Duration::from_millis(300)).await.is_none());

        handle.stop();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn missing_root_surfaces_subscription_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-created");

        let mut bus = EventBus::new(64, DedupConfig::default());
        let _rx = bus.subscribe().unwrap();
        let target = WatchTarget::local("l1", gone.to_string_lossy());
        let watcher = LocalWatcher::new(target, bus.publisher(), quick_config());
        let handle = watcher.spawn(CancelToken::new());

        let result = handle.join().await;
        assert!(matches!(result, Err(WatchError::Subscribe { .. })));
    }
}
