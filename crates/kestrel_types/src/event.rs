//! File events and fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::target::TargetId;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Add,
    Change,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "add" => Some(Self::Add),
            "change" => Some(Self::Change),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cheap change proxy for a file: size plus modification time.
///
/// Deliberately not a content hash: detecting change must not require
/// reading large files over slow storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    pub size_bytes: u64,
    /// Last modification time, Unix milliseconds.
    pub modified_at_ms: i64,
}

impl FileFingerprint {
    pub fn new(size_bytes: u64, modified_at_ms: i64) -> Self {
        Self {
            size_bytes,
            modified_at_ms,
        }
    }

    /// Fingerprint from filesystem metadata. `None` when the platform cannot
    /// report a modification time.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Option<Self> {
        let modified = metadata.modified().ok()?;
        let millis = modified
            .duration_since(std::time::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_millis() as i64)?;
        Some(Self::new(metadata.len(), millis))
    }
}

/// One observed change to one file under one watch target.
///
/// Produced by exactly one watcher per underlying change; consumed by the
/// event bus. Delete events carry no fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvent {
    pub kind: EventKind,
    pub target_id: TargetId,
    /// Path relative to the target root, forward slashes on every platform.
    pub rel_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<FileFingerprint>,
    pub discovered_at: DateTime<Utc>,
}

impl FileEvent {
    pub fn added(target_id: TargetId, rel_path: impl Into<String>, fingerprint: FileFingerprint) -> Self {
        Self {
            kind: EventKind::Add,
            target_id,
            rel_path: rel_path.into(),
            fingerprint: Some(fingerprint),
            discovered_at: Utc::now(),
        }
    }

    pub fn changed(target_id: TargetId, rel_path: impl Into<String>, fingerprint: FileFingerprint) -> Self {
        Self {
            kind: EventKind::Change,
            target_id,
            rel_path: rel_path.into(),
            fingerprint: Some(fingerprint),
            discovered_at: Utc::now(),
        }
    }

    pub fn deleted(target_id: TargetId, rel_path: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            target_id,
            rel_path: rel_path.into(),
            fingerprint: None,
            discovered_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_roundtrip() {
        for kind in [EventKind::Add, EventKind::Change, EventKind::Delete] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert!(EventKind::parse("rename").is_none());
    }

    #[test]
    fn delete_event_has_no_fingerprint() {
        let event = FileEvent::deleted(TargetId::new("t1"), "reports/q3.xlsx");
        assert_eq!(event.kind, EventKind::Delete);
        assert!(event.fingerprint.is_none());
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = FileEvent::added(
            TargetId::new("t1"),
            "a.txt",
            FileFingerprint::new(10, 1_700_000_000_000),
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"relPath\":\"a.txt\""));
        assert!(json.contains("\"sizeBytes\":10"));
        let parsed: FileEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
