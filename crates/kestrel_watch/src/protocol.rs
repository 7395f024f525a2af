//! Poll-based watcher for protocol-reached shares.
//!
//! Shares reached through a protocol connection have no notification
//! channel, so the watcher enumerates the full tree on a timer and
//! reconciles against its state cache. Transport errors trigger transparent
//! reconnection with linear backoff inside the tick; a tick that exhausts
//! its reconnect budget emits nothing and leaves the cache untouched, so the
//! next successful tick produces the same event set as if the failure had
//! never happened.

use std::time::Duration;

use kestrel_types::path::join_rel;
use kestrel_types::{CancelToken, WatchTarget};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{TransportError, WatchError};
use crate::handle::{ticks_missed, WatcherHandle};
use crate::share::ShareClient;
use crate::state::{FileStateCache, Observation};

use kestrel_ingest::EventPublisher;

#[derive(Debug, Clone)]
pub struct ProtocolPollConfig {
    /// Reconnect attempts per tick before the tick is marked failed.
    pub reconnect_attempts: u32,
    /// Base of the linear reconnect backoff: attempt n waits n × this.
    pub reconnect_backoff: Duration,
}

impl Default for ProtocolPollConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// Outcome of one scan tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickStatus {
    Completed,
    Failed,
}

pub struct ProtocolPollWatcher {
    target: WatchTarget,
    client: Box<dyn ShareClient>,
    cache: FileStateCache,
    publisher: EventPublisher,
    config: ProtocolPollConfig,
}

impl ProtocolPollWatcher {
    pub fn new(
        target: WatchTarget,
        client: Box<dyn ShareClient>,
        publisher: EventPublisher,
        config: ProtocolPollConfig,
    ) -> Self {
        Self {
            target,
            client,
            cache: FileStateCache::new(),
            publisher,
            config,
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
            uri = %self.target.uri,
            poll_interval_ms = self.target.poll_interval.as_millis() as u64,
            "protocol poll watcher started"
        );
        let mut timer = tokio::time::interval(self.target.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let started = Instant::now();
            debug!(target_id = %self.target.id, "scan tick started");
            let status = self.tick().await;
            let elapsed = started.elapsed();
            match status {
                Ok(TickStatus::Completed) => {
                    debug!(
                        target_id = %self.target.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        cached_paths = self.cache.len(),
                        "scan tick completed"
                    );
                }
                Ok(TickStatus::Failed) => {
                    warn!(
                        target_id = %self.target.id,
                        "scan tick failed; cache untouched until next tick"
                    );
                }
                // The bus closed: the pipeline is shutting down.
                Err(()) => break,
            }

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

        info!(target_id = %self.target.id, "protocol poll watcher stopped");
        Ok(())
    }

    /// One tick: scan, reconnecting on transport errors, then reconcile and
    /// publish. `Err(())` means the bus is gone.
    async fn tick(&mut self) -> Result<TickStatus, ()> {
        let mut reconnects = 0u32;
        loop {
            match self.scan().await {
                Ok(observations) => {
                    let events = self.cache.reconcile(&self.target.id, observations);
                    for event in events {
                        debug!(
                            target_id = %event.target_id,
                            kind = %event.kind,
                            path = %event.rel_path,
                            "event emitted"
                        );
                        if self.publisher.publish(event).await.is_err() {
                            return Err(());
                        }
                    }
                    return Ok(TickStatus::Completed);
                }
                Err(err) => {
                    if reconnects >= self.config.reconnect_attempts {
                        warn!(
                            target_id = %self.target.id,
                            attempts = reconnects,
                            error = %err,
                            "reconnect attempts exhausted for this tick"
                        );
                        return Ok(TickStatus::Failed);
                    }
                    reconnects += 1;
                    warn!(
                        target_id = %self.target.id,
                        attempt = reconnects,
                        error = %err,
                        "transport error during scan; reconnecting"
                    );
                    tokio::time::sleep(self.config.reconnect_backoff * reconnects).await;
                    if let Err(err) = self.client.reconnect().await {
                        debug!(
                            target_id = %self.target.id,
                            error = %err,
                            "reconnect attempt failed"
                        );
                    }
                }
            }
        }
    }

    /// Full recursive enumeration from the share root. Depth-first with an
    /// explicit stack; directories are enumerated lazily so very large trees
    /// never sit in memory at once.
    async fn scan(&mut self) -> Result<Vec<Observation>, TransportError> {
        let mut stack = vec![String::new()];
        let mut observations = Vec::new();

        while let Some(dir) = stack.pop() {
            let entries = self.client.list_dir(&dir).await?;
            for entry in entries {
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                let rel_path = join_rel(&dir, &entry.name);
                if entry.is_dir {
                    if self.target.recursive && !self.target.ignore.is_ignored(&rel_path) {
                        stack.push(rel_path);
                    }
                    continue;
                }
                if self.target.ignore.is_ignored(&rel_path) {
                    continue;
                }
                let size = entry.fingerprint.map(|f| f.size_bytes);
                if !self.target.filter.allows(&rel_path, size) {
                    debug!(target_id = %self.target.id, path = %rel_path, "file skipped by eligibility filter");
                    continue;
                }
                observations.push(Observation {
                    rel_path,
                    fingerprint: entry.fingerprint,
                });
            }
        }
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::ShareEntry;
    use async_trait::async_trait;
    use kestrel_ingest::{DedupConfig, EventBus};
    use kestrel_types::{EventKind, FileEvent, FileFingerprint, IgnoreSet};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    /// In-memory share tree with a scripted failure schedule.
    #[derive(Default)]
    struct FakeShareState {
        /// rel_path → fingerprint
        files: BTreeMap<String, FileFingerprint>,
        /// Fail the nth list_dir call (1-based) with a transport error.
        fail_on_call: Option<u64>,
        calls: u64,
        reconnects: u32,
    }

    #[derive(Clone)]
    struct FakeShareClient {
        state: Arc<Mutex<FakeShareState>>,
    }

    impl FakeShareClient {
        fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(FakeShareState::default())),
            }
        }

        fn put(&self, rel_path: &str, size: u64, mtime: i64) {
            self.state
                .lock()
                .unwrap()
                .files
                .insert(rel_path.to_string(), FileFingerprint::new(size, mtime));
        }

        fn remove(&self, rel_path: &str) {
            self.state.lock().unwrap().files.remove(rel_path);
        }

        fn fail_on_call(&self, call: u64) {
            let mut state = self.state.lock().unwrap();
            let current = state.calls;
            state.fail_on_call = Some(current + call);
        }

        fn reconnects(&self) -> u32 {
            self.state.lock().unwrap().reconnects
        }
    }

    #[async_trait]
    impl ShareClient for FakeShareClient {
        async fn list_dir(&mut self, rel_path: &str) -> Result<Vec<ShareEntry>, TransportError> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if state.fail_on_call == Some(state.calls) {
                state.fail_on_call = None;
                return Err(TransportError::ConnectionLost("broken pipe".into()));
            }

            let prefix = if rel_path.is_empty() {
                String::new()
            } else {
                format!("{rel_path}/")
            };
            let mut dirs = std::collections::BTreeSet::new();
            let mut entries = Vec::new();
            for (path, fingerprint) in &state.files {
                let Some(rest) = path.strip_prefix(&prefix) else {
                    continue;
                };
                match rest.split_once('/') {
                    Some((dir, _)) => {
                        dirs.insert(dir.to_string());
                    }
                    None => entries.push(ShareEntry {
                        name: rest.to_string(),
                        is_dir: false,
                        fingerprint: Some(*fingerprint),
                    }),
                }
            }
            for dir in dirs {
                entries.push(ShareEntry {
                    name: dir,
                    is_dir: true,
                    fingerprint: None,
                });
            }
            Ok(entries)
        }

        async fn reconnect(&mut self) -> Result<(), TransportError> {
            self.state.lock().unwrap().reconnects += 1;
            Ok(())
        }
    }

    fn quick_config() -> ProtocolPollConfig {
        ProtocolPollConfig {
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(1),
        }
    }

    fn watcher_with(
        client: FakeShareClient,
    ) -> (ProtocolPollWatcher, tokio::sync::mpsc::Receiver<FileEvent>) {
        let mut bus = EventBus::new(64, DedupConfig::default());
        let rx = bus.subscribe().unwrap();
        let mut target = WatchTarget::local("share1", "//nas01/data");
        target.kind = kestrel_types::TargetKind::ProtocolShare;
        target.ignore = IgnoreSet::with_defaults(Vec::<String>::new()).unwrap();
        let watcher = ProtocolPollWatcher::new(
            target,
            Box::new(client),
            bus.publisher(),
            quick_config(),
        );
        (watcher, rx)
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<FileEvent>) -> Vec<FileEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn add_change_delete_cycle_across_ticks() {
        let client = FakeShareClient::new();
        let (mut watcher, mut rx) = watcher_with(client.clone());

        // Empty share: nothing.
        assert_eq!(watcher.tick().await, Ok(TickStatus::Completed));
        assert!(drain(&mut rx).is_empty());

        // a.txt appears (10 bytes).
        client.put("a.txt", 10, 1_000);
        watcher.tick().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Add);
        assert_eq!(events[0].rel_path, "a.txt");

        // a.txt grows to 20 bytes.
        client.put("a.txt", 20, 2_000);
        watcher.tick().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);

        // a.txt removed.
        client.remove("a.txt");
        watcher.tick().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert!(watcher.cache.is_empty());
    }

    #[tokio::test]
    async fn unchanged_tree_emits_nothing_on_second_tick() {
        let client = FakeShareClient::new();
        client.put("a.txt", 1, 1);
        client.put("sub/b.txt", 2, 2);
        let (mut watcher, mut rx) = watcher_with(client);

        watcher.tick().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 2);

        watcher.tick().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn subdirectories_are_enumerated() {
        let client = FakeShareClient::new();
        client.put("top.txt", 1, 1);
        client.put("a/b/c/deep.txt", 2, 2);
        let (mut watcher, mut rx) = watcher_with(client);

        watcher.tick().await.unwrap();
        let mut paths: Vec<_> = drain(&mut rx).into_iter().map(|e| e.rel_path).collect();
        paths.sort();
        assert_eq!(paths, vec!["a/b/c/deep.txt", "top.txt"]);
    }

    #[tokio::test]
    async fn transport_failure_mid_scan_recovers_on_reconnect() {
        let client = FakeShareClient::new();
        client.put("a.txt", 1, 1);
        client.put("b.txt", 2, 2);
        let (mut watcher, mut rx) = watcher_with(client.clone());

        // First list_dir call of the tick dies; the retry after reconnect
        // sees the full tree. Exactly one add per file, no false deletes.
        client.fail_on_call(1);
        assert_eq!(watcher.tick().await, Ok(TickStatus::Completed));
        assert!(client.reconnects() >= 1);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Add));
    }

    #[tokio::test]
    async fn failed_tick_is_invisible_in_event_history() {
        let client = FakeShareClient::new();
        client.put("a.txt", 1, 1);
        let (mut watcher, mut rx) = watcher_with(client.clone());

        watcher.tick().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        // With no reconnect budget, one transport error fails the whole
        // tick: nothing is emitted and the cache stays untouched.
        watcher.config.reconnect_attempts = 0;
        client.fail_on_call(1);
        assert_eq!(watcher.tick().await, Ok(TickStatus::Failed));
        assert!(drain(&mut rx).is_empty());

        // Next tick succeeds over the unchanged tree: nothing is emitted,
        // as if the failed tick never happened.
        watcher.tick().await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(watcher.cache.len(), 1);
    }

    #[tokio::test]
    async fn ignored_and_filtered_files_never_surface() {
        let client = FakeShareClient::new();
        client.put("keep.txt", 1, 1);
        client.put("junk.tmp", 1, 1);
        client.put("node_modules/lib.js", 1, 1);
        let (mut watcher, mut rx) = watcher_with(client);

        watcher.tick().await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].rel_path, "keep.txt");
    }

    #[tokio::test]
    async fn spawned_watcher_stops_cooperatively() {
        let client = FakeShareClient::new();
        let (watcher, _rx) = watcher_with(client);
        let cancel = CancelToken::new();
        let handle = watcher.spawn(cancel);

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
        handle.join().await.unwrap();
    }
}
