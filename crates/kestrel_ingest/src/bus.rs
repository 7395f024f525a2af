//! In-process event fan-in.
//!
//! All active watchers publish into one bus. The bus drops duplicates seen
//! within a short trailing window (a local watcher's debounce and the next
//! poll tick frequently observe the same stabilized write) and forwards
//! everything else into a bounded channel. A full channel blocks the
//! publisher: under load, discovery is the rate-limited side, never silent
//! loss.
//!
//! Ordering: events from one watcher task arrive in discovery order and are
//! forwarded in that order. No ordering is promised across targets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::trace;

use kestrel_types::{EventKind, FileEvent, FileFingerprint, TargetId};

/// The bus (and with it the queue) has shut down.
#[derive(Debug, Error)]
#[error("event bus closed")]
pub struct BusClosed;

/// Bounds of the trailing dedup window. An entry expires after `window` or
/// once `max_entries` newer keys arrive, whichever happens first.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub window: Duration,
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_entries: 1024,
        }
    }
}

type DedupKey = (TargetId, String, Option<FileFingerprint>);

/// Trailing window of recently published event keys.
struct DedupWindow {
    config: DedupConfig,
    seen: HashMap<DedupKey, Instant>,
    order: VecDeque<(DedupKey, Instant)>,
}

impl DedupWindow {
    fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an event key. Returns true when the key was already seen
    /// inside the window (a duplicate to drop).
    fn observe(&mut self, event: &FileEvent) -> bool {
        let now = Instant::now();
        self.evict(now);

        let key: DedupKey = (
            event.target_id.clone(),
            event.rel_path.clone(),
            event.fingerprint,
        );
        if self.seen.contains_key(&key) {
            return true;
        }
        if event.kind == EventKind::Delete {
            // The file is gone; a re-appearance with the same fingerprint is
            // a genuinely new add and must not be swallowed. Stale order
            // entries expire on their own.
            self.seen.retain(|(target_id, rel_path, fingerprint), _| {
                fingerprint.is_none()
                    || target_id != &event.target_id
                    || rel_path != &event.rel_path
            });
        }
        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        self.enforce_cap();
        false
    }

    fn enforce_cap(&mut self) {
        while self.order.len() > self.config.max_entries {
            if let Some((key, stamp)) = self.order.pop_front() {
                if self.seen.get(&key) == Some(&stamp) {
                    self.seen.remove(&key);
                }
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some((key, stamp)) = self.order.front() {
            if now.duration_since(*stamp) <= self.config.window {
                break;
            }
            // Only drop the map entry if it still belongs to this stamp; a
            // re-inserted key owns a newer one.
            if self.seen.get(key) == Some(stamp) {
                self.seen.remove(key);
            }
            self.order.pop_front();
        }
    }
}

/// Clonable publishing side of the bus; one per watcher.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<FileEvent>,
    dedup: Arc<Mutex<DedupWindow>>,
}

impl EventPublisher {
    /// Publish an event, blocking when the downstream queue is full. A
    /// duplicate inside the dedup window is dropped silently.
    pub async fn publish(&self, event: FileEvent) -> Result<(), BusClosed> {
        {
            let mut dedup = self.dedup.lock().await;
            if dedup.observe(&event) {
                trace!(
                    target_id = %event.target_id,
                    path = %event.rel_path,
                    kind = %event.kind,
                    "duplicate event dropped by dedup window"
                );
                return Ok(());
            }
        }
        self.tx.send(event).await.map_err(|_| BusClosed)
    }
}

/// In-process fan-in point between watchers and the ingestion queue.
pub struct EventBus {
    tx: mpsc::Sender<FileEvent>,
    rx: Option<mpsc::Receiver<FileEvent>>,
    dedup: Arc<Mutex<DedupWindow>>,
}

impl EventBus {
    /// `capacity` bounds how many events may sit between discovery and
    /// processing; publishers block once it is reached.
    pub fn new(capacity: usize, dedup: DedupConfig) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Some(rx),
            dedup: Arc::new(Mutex::new(DedupWindow::new(dedup))),
        }
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
            dedup: Arc::clone(&self.dedup),
        }
    }

    /// Take the consuming side. The bus has exactly one subscriber (the
    /// ingestion queue); subsequent calls return `None`.
    pub fn subscribe(&mut self) -> Option<mpsc::Receiver<FileEvent>> {
        self.rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::FileFingerprint;

    fn event(path: &str, size: u64) -> FileEvent {
        FileEvent::added(
            TargetId::new("t1"),
            path,
            FileFingerprint::new(size, 1_000),
        )
    }

    #[tokio::test]
    async fn duplicate_within_window_is_dropped() {
        let mut bus = EventBus::new(8, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 10)).await.unwrap();
        publisher.publish(event("a.txt", 10)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.rel_path, "a.txt");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn different_fingerprint_is_not_a_duplicate() {
        let mut bus = EventBus::new(8, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 10)).await.unwrap();
        publisher.publish(event("a.txt", 20)).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn window_expiry_allows_republish() {
        let mut bus = EventBus::new(8, DedupConfig {
            window: Duration::from_millis(20),
            max_entries: 16,
        });
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        publisher.publish(event("a.txt", 10)).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn entry_cap_bounds_the_window() {
        let mut bus = EventBus::new(64, DedupConfig {
            window: Duration::from_secs(60),
            max_entries: 2,
        });
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 1)).await.unwrap();
        publisher.publish(event("b.txt", 1)).await.unwrap();
        publisher.publish(event("c.txt", 1)).await.unwrap();
        // "a" has been pushed out of the window despite the long expiry.
        publisher.publish(event("a.txt", 1)).await.unwrap();

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn readded_file_with_same_fingerprint_survives_a_delete() {
        let mut bus = EventBus::new(16, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 10)).await.unwrap();
        publisher
            .publish(FileEvent::deleted(TargetId::new("t1"), "a.txt"))
            .await
            .unwrap();
        // The file comes back byte-identical inside the window: that is a
        // real add, not a duplicate.
        publisher.publish(event("a.txt", 10)).await.unwrap();

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn full_channel_blocks_publisher() {
        let mut bus = EventBus::new(1, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        publisher.publish(event("a.txt", 1)).await.unwrap();

        let blocked = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish(event("b.txt", 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Consuming one event unblocks the publisher.
        assert_eq!(rx.recv().await.unwrap().rel_path, "a.txt");
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().rel_path, "b.txt");
    }

    #[tokio::test]
    async fn per_target_order_is_preserved() {
        let mut bus = EventBus::new(16, DedupConfig::default());
        let mut rx = bus.subscribe().unwrap();
        let publisher = bus.publisher();

        for size in 1..=5 {
            publisher.publish(event("log.txt", size)).await.unwrap();
        }
        for expected in 1..=5 {
            let got = rx.recv().await.unwrap();
            assert_eq!(got.fingerprint.unwrap().size_bytes, expected);
        }
    }
}
