//! Watch target descriptors.
//!
//! A `WatchTarget` is one configured folder or share to monitor. Targets are
//! built once at startup from configuration and are immutable afterwards;
//! every watcher task owns a clone of its target.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::patterns::{FileFilter, IgnoreSet};

/// Unique identifier of a watch target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random id for targets configured without one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a target's storage is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    /// Local directory with native change notification.
    #[default]
    Local,
    /// Network share reached through a protocol connection; no native
    /// notification channel exists, so the share is polled.
    ProtocolShare,
    /// Network share mapped to a local mount point by the mount manager,
    /// then polled through ordinary filesystem calls.
    OsMount,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::ProtocolShare => "protocol-share",
            Self::OsMount => "os-mount",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "protocol-share" => Some(Self::ProtocolShare),
            "os-mount" => Some(Self::OsMount),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret value that never appears in logs.
///
/// `Debug` and `Display` are redacted; callers that genuinely need the value
/// go through [`Secret::reveal`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Credentials for a network share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Secret,
    #[serde(default)]
    pub domain: Option<String>,
}

/// One configured folder or share to monitor.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub id: TargetId,
    /// Location of the target: a local path, a `//host/share` style share
    /// URI, or whatever the protocol connector understands.
    pub uri: String,
    pub kind: TargetKind,
    pub credentials: Option<Credentials>,
    /// Whether subdirectories are watched.
    pub recursive: bool,
    /// Poll cadence for the poll-based watcher variants.
    pub poll_interval: Duration,
    /// Paths matching any of these globs are never reported.
    pub ignore: IgnoreSet,
    /// Eligibility filter (extension allow-list, size ceiling).
    pub filter: FileFilter,
}

impl WatchTarget {
    /// Minimal target for a local directory; used by tests and embedders.
    pub fn local(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: TargetId::new(id),
            uri: uri.into(),
            kind: TargetKind::Local,
            credentials: None,
            recursive: true,
            poll_interval: Duration::from_secs(5),
            ignore: IgnoreSet::empty(),
            filter: FileFilter::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_kind_roundtrip() {
        for kind in [TargetKind::Local, TargetKind::ProtocolShare, TargetKind::OsMount] {
            assert_eq!(TargetKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TargetKind::parse("OS-MOUNT"), Some(TargetKind::OsMount));
        assert!(TargetKind::parse("ftp").is_none());
    }

    #[test]
    fn secret_is_redacted() {
        let creds = Credentials {
            username: "svc-ingest".to_string(),
            password: Secret::new("hunter2"),
            domain: Some("corp".to_string()),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("Secret(***)"));
        assert_eq!(creds.password.reveal(), "hunter2");
    }

    #[test]
    fn secret_display_is_redacted() {
        assert_eq!(Secret::new("topsecret").to_string(), "***");
    }
}
