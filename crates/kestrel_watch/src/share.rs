//! The protocol-share connection seam.
//!
//! Kestrel does not speak any share protocol itself; the watcher drives
//! whatever implements [`ShareClient`] and owns that connection exclusively,
//! publishing only immutable events outward. [`DirShareClient`] is the
//! in-tree reference connector: it serves an ordinary directory through the
//! trait, which is what integration tests poll against and what lets an
//! operator expose an externally-mounted path with forced-polling semantics.

use std::path::PathBuf;

use async_trait::async_trait;
use kestrel_types::FileFingerprint;

use crate::error::TransportError;

/// One directory entry as reported by the share.
#[derive(Debug, Clone)]
pub struct ShareEntry {
    pub name: String,
    pub is_dir: bool,
    /// `None` for a file whose metadata could not be read; such files are
    /// retried next tick rather than guessed at.
    pub fingerprint: Option<FileFingerprint>,
}

/// A live connection to one share. Not `Sync`: exactly one watcher task
/// drives a connection.
#[async_trait]
pub trait ShareClient: Send {
    /// Enumerate one directory, relative to the share root ("" is the root).
    async fn list_dir(&mut self, rel_path: &str) -> Result<Vec<ShareEntry>, TransportError>;

    /// Re-establish the connection after a transport error.
    async fn reconnect(&mut self) -> Result<(), TransportError>;
}

/// Reference connector serving a local directory through the share seam.
pub struct DirShareClient {
    root: PathBuf,
}

impl DirShareClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ShareClient for DirShareClient {
    async fn list_dir(&mut self, rel_path: &str) -> Result<Vec<ShareEntry>, TransportError> {
        let dir = if rel_path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel_path)
        };
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.metadata().await {
                Ok(metadata) => {
                    if metadata.is_dir() {
                        entries.push(ShareEntry {
                            name,
                            is_dir: true,
                            fingerprint: None,
                        });
                    } else if metadata.is_file() {
                        entries.push(ShareEntry {
                            name,
                            is_dir: false,
                            fingerprint: FileFingerprint::from_metadata(&metadata),
                        });
                    }
                    // Symlinks and specials are not served.
                }
                Err(_) => {
                    // Listed but unreadable: surfaced as a fingerprint-less
                    // file so the watcher retries it next tick.
                    entries.push(ShareEntry {
                        name,
                        is_dir: false,
                        fingerprint: None,
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn reconnect(&mut self) -> Result<(), TransportError> {
        // A directory needs no session; verify it is still there.
        tokio::fs::metadata(&self.root).await?;
        Ok(())
    }
}
