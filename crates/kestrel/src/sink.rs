//! Default downstream processor: an append-only JSONL spool.
//!
//! One serialized event per line. Real deployments put extraction and
//! summarization behind the [`Processor`] trait instead; the spool is the
//! reference integration and what the end-to-end tests read back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kestrel_ingest::{ProcessingError, Processor};
use kestrel_types::FileEvent;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Processor for JsonlSink {
    async fn process(&self, event: &FileEvent) -> Result<(), ProcessingError> {
        // A malformed event cannot become well-formed by retrying.
        let mut line = serde_json::to_string(event)
            .map_err(|err| ProcessingError::Terminal(format!("event serialization: {err}")))?;
        line.push('\n');

        // Disk/network hiccups are worth retrying.
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| ProcessingError::Retryable(format!("spool write: {err}")))?;
        file.flush()
            .await
            .map_err(|err| ProcessingError::Retryable(format!("spool flush: {err}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_types::{EventKind, FileFingerprint, TargetId};

    #[tokio::test]
    async fn events_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let spool = dir.path().join("events.jsonl");
        let sink = JsonlSink::create(&spool).await.unwrap();

        let add = FileEvent::added(
            TargetId::new("t1"),
            "a.txt",
            FileFingerprint::new(5, 1_000),
        );
        let delete = FileEvent::deleted(TargetId::new("t1"), "a.txt");
        sink.process(&add).await.unwrap();
        sink.process(&delete).await.unwrap();

        let contents = std::fs::read_to_string(&spool).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: FileEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, EventKind::Add);
        let second: FileEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, EventKind::Delete);
        assert!(second.fingerprint.is_none());
    }
}
