//! Per-target file state and scan reconciliation.
//!
//! The cache maps relative path → last-seen fingerprint for one watch
//! target. A completed scan is reconciled against it in a single pass: new
//! paths become adds, changed fingerprints become changes, and cached paths
//! the scan did not observe become deletes and are evicted in the same pass.
//! A failed or skipped scan must simply not call [`FileStateCache::reconcile`];
//! the untouched cache then makes the next successful scan recover
//! idempotently, with no duplicate adds and no false deletes.

use std::collections::HashMap;

use kestrel_types::{FileEvent, FileFingerprint, TargetId};

/// One file as seen by one scan pass.
///
/// `fingerprint` is `None` when the file was listed but its metadata could
/// not be read. Such paths produce no event and keep their cache entry, so a
/// transient read error is retried next tick instead of surfacing as a
/// delete.
#[derive(Debug, Clone)]
pub struct Observation {
    pub rel_path: String,
    pub fingerprint: Option<FileFingerprint>,
}

impl Observation {
    pub fn new(rel_path: impl Into<String>, fingerprint: FileFingerprint) -> Self {
        Self {
            rel_path: rel_path.into(),
            fingerprint: Some(fingerprint),
        }
    }

    pub fn unreadable(rel_path: impl Into<String>) -> Self {
        Self {
            rel_path: rel_path.into(),
            fingerprint: None,
        }
    }
}

/// Last-seen fingerprints for one target. Owned exclusively by that
/// target's watcher task.
#[derive(Debug, Default)]
pub struct FileStateCache {
    entries: HashMap<String, FileFingerprint>,
}

impl FileStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, rel_path: &str) -> Option<&FileFingerprint> {
        self.entries.get(rel_path)
    }

    pub fn insert(&mut self, rel_path: impl Into<String>, fingerprint: FileFingerprint) {
        self.entries.insert(rel_path.into(), fingerprint);
    }

    /// Evict one path. Returns true when it was present.
    pub fn remove(&mut self, rel_path: &str) -> bool {
        self.entries.remove(rel_path).is_some()
    }

    /// Apply a complete scan pass and derive the events it implies.
    ///
    /// Event order: adds/changes in observation order, then deletes. The
    /// cache is replaced by the observed state in the same pass, so calling
    /// this twice with identical observations yields zero events the second
    /// time.
    pub fn reconcile(
        &mut self,
        target_id: &TargetId,
        observations: Vec<Observation>,
    ) -> Vec<FileEvent> {
        let mut next = HashMap::with_capacity(observations.len());
        let mut events = Vec::new();

        for observation in observations {
            match observation.fingerprint {
                Some(fingerprint) => {
                    match self.entries.get(&observation.rel_path) {
                        None => events.push(FileEvent::added(
                            target_id.clone(),
                            observation.rel_path.clone(),
                            fingerprint,
                        )),
                        Some(previous) if *previous != fingerprint => {
                            events.push(FileEvent::changed(
                                target_id.clone(),
                                observation.rel_path.clone(),
                                fingerprint,
                            ));
                        }
                        Some(_) => {}
                    }
                    next.insert(observation.rel_path, fingerprint);
                }
                None => {
                    // Unreadable this pass: carry the old entry forward so
                    // the path neither churns nor reads as deleted.
                    if let Some(previous) = self.entries.get(&observation.rel_path) {
                        next.insert(observation.rel_path, *previous);
                    }
                }
            }
        }

        for rel_path in self.entries.keys() {
            if !next.contains_key(rel_path) {
                events.push(FileEvent::deleted(target_id.clone(), rel_path.clone()));
            }
        }

        self.entries = next;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::EventKind;

    fn target() -> TargetId {
        TargetId::new("t1")
    }

    fn fp(size: u64, mtime: i64) -> FileFingerprint {
        FileFingerprint::new(size, mtime)
    }

    #[test]
    fn first_scan_emits_adds() {
        let mut cache = FileStateCache::new();
        let events = cache.reconcile(
            &target(),
            vec![
                Observation::new("a.txt", fp(10, 100)),
                Observation::new("sub/b.txt", fp(20, 200)),
            ],
        );
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Add));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn idempotent_rescan_emits_nothing() {
        let mut cache = FileStateCache::new();
        let observations = vec![
            Observation::new("a.txt", fp(10, 100)),
            Observation::new("b.txt", fp(20, 200)),
        ];
        cache.reconcile(&target(), observations.clone());
        let second = cache.reconcile(&target(), observations);
        assert!(second.is_empty());
    }

    #[test]
    fn size_or_mtime_change_emits_exactly_one_change() {
        let mut cache = FileStateCache::new();
        cache.reconcile(&target(), vec![Observation::new("a.txt", fp(10, 100))]);

        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(20, 100))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);

        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(20, 300))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);

        // Same size and mtime: touching the file yields nothing.
        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(20, 300))]);
        assert!(events.is_empty());
    }

    #[test]
    fn missing_paths_become_deletes_and_are_evicted() {
        let mut cache = FileStateCache::new();
        cache.reconcile(
            &target(),
            vec![
                Observation::new("a.txt", fp(1, 1)),
                Observation::new("b.txt", fp(2, 2)),
                Observation::new("c.txt", fp(3, 3)),
            ],
        );

        let events = cache.reconcile(&target(), vec![Observation::new("b.txt", fp(2, 2))]);
        let deletes: Vec<_> = events.iter().filter(|e| e.kind == EventKind::Delete).collect();
        assert_eq!(deletes.len(), 2);
        assert!(deletes.iter().all(|e| e.fingerprint.is_none()));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a.txt").is_none());
        assert!(cache.get("c.txt").is_none());
    }

    #[test]
    fn unreadable_fingerprint_is_neither_event_nor_delete() {
        let mut cache = FileStateCache::new();
        cache.reconcile(&target(), vec![Observation::new("a.txt", fp(10, 100))]);

        // Metadata unreadable this pass: no event, entry retained.
        let events = cache.reconcile(&target(), vec![Observation::unreadable("a.txt")]);
        assert!(events.is_empty());
        assert_eq!(cache.get("a.txt"), Some(&fp(10, 100)));

        // Next pass reads it fine and unchanged: still nothing.
        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(10, 100))]);
        assert!(events.is_empty());
    }

    #[test]
    fn unreadable_new_path_emits_nothing_until_readable() {
        let mut cache = FileStateCache::new();
        let events = cache.reconcile(&target(), vec![Observation::unreadable("new.txt")]);
        assert!(events.is_empty());
        assert!(cache.is_empty());

        let events = cache.reconcile(&target(), vec![Observation::new("new.txt", fp(5, 50))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Add);
    }

    #[test]
    fn add_modify_delete_cycle() {
        let mut cache = FileStateCache::new();

        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(10, 100))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Add);

        let events = cache.reconcile(&target(), vec![Observation::new("a.txt", fp(20, 150))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Change);

        let events = cache.reconcile(&target(), Vec::new());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Delete);
        assert!(cache.is_empty());
    }

    #[test]
    fn skipped_scan_keeps_cache_for_clean_recovery() {
        let mut cache = FileStateCache::new();
        cache.reconcile(
            &target(),
            vec![
                Observation::new("a.txt", fp(1, 1)),
                Observation::new("b.txt", fp(2, 2)),
            ],
        );

        // A failed tick never reaches reconcile. The next successful scan of
        // the unchanged tree emits nothing: as if the failure never happened.
        let events = cache.reconcile(
            &target(),
            vec![
                Observation::new("a.txt", fp(1, 1)),
                Observation::new("b.txt", fp(2, 2)),
            ],
        );
        assert!(events.is_empty());
    }
}
