//! The downstream processing boundary.
//!
//! Kestrel makes no assumption about what processing does (content
//! extraction, summarization, persistence) beyond two things: it tolerates
//! at-least-once delivery, and its errors distinguish retryable from
//! terminal so the queue can decide whether to requeue.

use async_trait::async_trait;
use kestrel_types::FileEvent;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Transient failure; the item is requeued until the retry ceiling.
    #[error("retryable processing failure: {0}")]
    Retryable(String),
    /// Permanent failure; the item is reported and never retried.
    #[error("terminal processing failure: {0}")]
    Terminal(String),
}

impl ProcessingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Downstream collaborator called by the ingestion queue, one event at a
/// time within a batch.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, event: &FileEvent) -> Result<(), ProcessingError>;
}
