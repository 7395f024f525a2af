//! End-to-end pipeline tests: real directories, real watcher tasks, a
//! collecting processor standing in for the downstream system.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kestrel::config::{Config, TargetConfig};
use kestrel::pipeline::{Pipeline, ShutdownOutcome};
use kestrel_ingest::{ProcessingError, Processor};
use kestrel_types::{EventKind, FileEvent, TargetKind};

#[derive(Default)]
struct CollectingProcessor {
    events: Mutex<Vec<FileEvent>>,
}

impl CollectingProcessor {
    fn snapshot(&self) -> Vec<FileEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for CollectingProcessor {
    async fn process(&self, event: &FileEvent) -> Result<(), ProcessingError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn test_config(uri: &str, kind: TargetKind) -> Config {
    let mut config = Config::default();
    config.pipeline.poll_interval_ms = 100;
    config.pipeline.processing_delay_ms = 50;
    config.pipeline.stability_window_ms = 150;
    config.pipeline.dedup_window_secs = 1;
    config.targets.push(TargetConfig {
        id: Some("t1".to_string()),
        uri: uri.to_string(),
        kind,
        recursive: true,
        poll_interval_ms: None,
        ignore_patterns: Vec::new(),
        username: None,
        password: None,
        domain: None,
    });
    config.validate().unwrap();
    config
}

/// Poll the collector until `predicate` holds or the timeout expires.
async fn wait_until(
    collector: &CollectingProcessor,
    timeout: Duration,
    predicate: impl Fn(&[FileEvent]) -> bool,
) -> Vec<FileEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let events = collector.snapshot();
        if predicate(&events) {
            return events;
        }
        if tokio::time::Instant::now() >= deadline {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn local_target_add_change_delete_reaches_processor() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir.path().to_string_lossy(), TargetKind::Local);
    let collector = Arc::new(CollectingProcessor::default());

    let pipeline = Pipeline::start(&config, collector.clone()).await.unwrap();

    // Add.
    std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events.iter().any(|e| e.kind == EventKind::Add && e.rel_path == "a.txt")
    })
    .await;
    assert!(
        events.iter().any(|e| e.kind == EventKind::Add && e.rel_path == "a.txt"),
        "expected add for a.txt, got {events:?}"
    );

    // Change: grow the file.
    std::fs::write(dir.path().join("a.txt"), b"01234567890123456789").unwrap();
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events.iter().any(|e| e.kind == EventKind::Change && e.rel_path == "a.txt")
    })
    .await;
    assert!(
        events.iter().any(|e| e.kind == EventKind::Change),
        "expected change for a.txt, got {events:?}"
    );

    // Delete.
    std::fs::remove_file(dir.path().join("a.txt")).unwrap();
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events.iter().any(|e| e.kind == EventKind::Delete && e.rel_path == "a.txt")
    })
    .await;
    assert!(
        events.iter().any(|e| e.kind == EventKind::Delete),
        "expected delete for a.txt, got {events:?}"
    );

    match pipeline.shutdown().await {
        ShutdownOutcome::Drained(report) => {
            assert_eq!(report.residual, 0);
            assert_eq!(report.terminal_failures, 0);
        }
        ShutdownOutcome::TimedOut => panic!("drain timed out"),
    }
}

#[tokio::test]
async fn protocol_share_target_polls_through_reference_connector() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("reports")).unwrap();
    std::fs::write(dir.path().join("reports/q1.txt"), b"numbers").unwrap();

    let config = test_config(&dir.path().to_string_lossy(), TargetKind::ProtocolShare);
    let collector = Arc::new(CollectingProcessor::default());
    let pipeline = Pipeline::start(&config, collector.clone()).await.unwrap();

    // The pre-existing file arrives on the first poll tick.
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events
            .iter()
            .any(|e| e.kind == EventKind::Add && e.rel_path == "reports/q1.txt")
    })
    .await;
    assert!(
        events.iter().any(|e| e.rel_path == "reports/q1.txt"),
        "expected add for reports/q1.txt, got {events:?}"
    );

    // Removal arrives on a later tick as a delete.
    std::fs::remove_file(dir.path().join("reports/q1.txt")).unwrap();
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events
            .iter()
            .any(|e| e.kind == EventKind::Delete && e.rel_path == "reports/q1.txt")
    })
    .await;
    assert!(
        events.iter().any(|e| e.kind == EventKind::Delete),
        "expected delete for reports/q1.txt, got {events:?}"
    );

    match pipeline.shutdown().await {
        ShutdownOutcome::Drained(report) => assert_eq!(report.residual, 0),
        ShutdownOutcome::TimedOut => panic!("drain timed out"),
    }
}

#[tokio::test]
async fn unresolvable_protocol_target_is_disabled_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // Two targets: one healthy local directory, one share nobody can reach.
    let mut config = test_config(&dir.path().to_string_lossy(), TargetKind::Local);
    config.targets.push(TargetConfig {
        id: Some("dead".to_string()),
        uri: "//unreachable-host/share".to_string(),
        kind: TargetKind::ProtocolShare,
        recursive: true,
        poll_interval_ms: None,
        ignore_patterns: Vec::new(),
        username: None,
        password: None,
        domain: None,
    });
    config.validate().unwrap();

    let collector = Arc::new(CollectingProcessor::default());
    let pipeline = Pipeline::start(&config, collector.clone()).await.unwrap();

    // The healthy target still ingests.
    std::fs::write(dir.path().join("alive.txt"), b"still here").unwrap();
    let events = wait_until(&collector, Duration::from_secs(10), |events| {
        events.iter().any(|e| e.rel_path == "alive.txt")
    })
    .await;
    assert!(events.iter().any(|e| e.rel_path == "alive.txt"));

    match pipeline.shutdown().await {
        ShutdownOutcome::Drained(_) => {}
        ShutdownOutcome::TimedOut => panic!("drain timed out"),
    }
}
