//! Bounded delivery queue with batch draining and retry.
//!
//! The drain loop pulls deduplicated events from the bus, groups them into
//! batches, and hands each item to the [`Processor`]. A retryable failure
//! bumps the item's attempt counter and requeues it at the tail (a poison
//! item cannot starve the queue) until the retry ceiling, where it is
//! terminally reported. Nothing is persisted: durability across process
//! restarts is an explicit scope boundary, and the shutdown report tells the
//! caller exactly how many items were left undelivered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use kestrel_types::{CancelToken, FileEvent};

use crate::processor::{ProcessingError, Processor};

/// Longest a retrying item will back off between attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Items handed to the processor per round.
    pub batch_size: usize,
    /// How long to wait for a batch to fill before processing a partial one.
    pub processing_delay: Duration,
    /// Total delivery attempts per item, first try included.
    pub max_attempts: u32,
    /// Base backoff after a failed attempt; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            processing_delay: Duration::from_millis(1_000),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// One event riding through the queue.
#[derive(Debug)]
pub struct QueueItem {
    pub event: FileEvent,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Earliest moment the item may be retried; `None` means ready now.
    ready_at: Option<Instant>,
}

impl QueueItem {
    fn new(event: FileEvent) -> Self {
        Self {
            event,
            attempts: 0,
            first_seen_at: Utc::now(),
            last_error: None,
            ready_at: None,
        }
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.map_or(true, |at| at <= now)
    }
}

/// Counters reported when the drain loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: u64,
    /// Individual retry deliveries that were scheduled.
    pub retried: u64,
    pub terminal_failures: u64,
    /// Items still queued but undelivered at shutdown.
    pub residual: usize,
}

/// The sole component that calls the external processor.
pub struct IngestionQueue {
    config: QueueConfig,
    events: mpsc::Receiver<FileEvent>,
    processor: Arc<dyn Processor>,
    shutdown: CancelToken,
    depth: Arc<AtomicUsize>,
}

impl IngestionQueue {
    pub fn new(
        config: QueueConfig,
        events: mpsc::Receiver<FileEvent>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            config,
            events,
            processor,
            shutdown: CancelToken::new(),
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Token that triggers cooperative shutdown of the drain loop.
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Gauge of items currently waiting in the queue (excludes the bus
    /// channel). Updated by the drain loop; read by status reporting.
    pub fn depth_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }

    /// Run until shutdown is requested or the bus closes. The in-flight
    /// batch always completes; the report carries the residual count.
    pub async fn drain_loop(mut self) -> DrainReport {
        let mut pending: VecDeque<QueueItem> = VecDeque::new();
        let mut report = DrainReport::default();
        let mut bus_open = true;

        info!(
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "ingestion queue started"
        );

        loop {
            self.depth.store(pending.len(), Ordering::Relaxed);
            if self.shutdown.is_cancelled() {
                break;
            }
            if pending.is_empty() && !bus_open {
                break;
            }

            if pending.is_empty() {
                // Nothing queued: wait for the first event or shutdown.
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    event = self.events.recv() => match event {
                        Some(event) => pending.push_back(QueueItem::new(event)),
                        None => { bus_open = false; continue; }
                    },
                }
            } else if let Some(wait) = backoff_wait(&pending) {
                // Everything queued is backing off; use the gap to pull new
                // events, but never sleep past the earliest retry.
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {},
                    event = self.events.recv(), if bus_open => match event {
                        Some(event) => pending.push_back(QueueItem::new(event)),
                        None => bus_open = false,
                    },
                }
            }

            // Top the batch up until batch_size or the processing delay.
            let deadline = Instant::now() + self.config.processing_delay;
            while bus_open && ready_count(&pending) < self.config.batch_size {
                if self.shutdown.is_cancelled() || Instant::now() >= deadline {
                    break;
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => {},
                    _ = tokio::time::sleep_until(deadline) => {},
                    event = self.events.recv() => match event {
                        Some(event) => pending.push_back(QueueItem::new(event)),
                        None => bus_open = false,
                    },
                }
            }

            // Shutdown stops new batches; only an already in-flight batch
            // runs to completion.
            if self.shutdown.is_cancelled() {
                break;
            }
            let batch = take_ready(&mut pending, self.config.batch_size);
            if batch.is_empty() {
                continue;
            }
            debug!(batch = batch.len(), queued = pending.len(), "processing batch");
            self.process_batch(batch, &mut pending, &mut report).await;
        }

        // Stop intake and count what never made it out.
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            pending.push_back(QueueItem::new(event));
        }
        report.residual = pending.len();
        self.depth.store(pending.len(), Ordering::Relaxed);
        info!(
            delivered = report.delivered,
            retried = report.retried,
            terminal_failures = report.terminal_failures,
            residual = report.residual,
            "ingestion queue drained"
        );
        report
    }

    async fn process_batch(
        &self,
        batch: Vec<QueueItem>,
        pending: &mut VecDeque<QueueItem>,
        report: &mut DrainReport,
    ) {
        for mut item in batch {
            item.attempts += 1;
            match self.processor.process(&item.event).await {
                Ok(()) => {
                    report.delivered += 1;
                    debug!(
                        target_id = %item.event.target_id,
                        path = %item.event.rel_path,
                        kind = %item.event.kind,
                        attempts = item.attempts,
                        "event delivered"
                    );
                }
                Err(err) => {
                    item.last_error = Some(err.to_string());
                    if err.is_retryable() && item.attempts < self.config.max_attempts {
                        let backoff = retry_backoff(
                            self.config.retry_backoff,
                            item.attempts,
                        );
                        item.ready_at = Some(Instant::now() + backoff);
                        warn!(
                            target_id = %item.event.target_id,
                            path = %item.event.rel_path,
                            attempts = item.attempts,
                            max_attempts = self.config.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "delivery failed; requeued at tail"
                        );
                        report.retried += 1;
                        pending.push_back(item);
                    } else {
                        report.terminal_failures += 1;
                        error!(
                            target_id = %item.event.target_id,
                            path = %item.event.rel_path,
                            kind = %item.event.kind,
                            attempts = item.attempts,
                            error = %err,
                            "item terminally failed"
                        );
                    }
                }
            }
        }
    }
}

/// Doubling backoff, capped.
fn retry_backoff(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(10);
    base.checked_mul(factor).unwrap_or(MAX_RETRY_BACKOFF).min(MAX_RETRY_BACKOFF)
}

fn ready_count(pending: &VecDeque<QueueItem>) -> usize {
    let now = Instant::now();
    pending.iter().filter(|item| item.is_ready(now)).count()
}

/// Pop up to `limit` ready items, preserving queue order for the rest.
fn take_ready(pending: &mut VecDeque<QueueItem>, limit: usize) -> Vec<QueueItem> {
    let now = Instant::now();
    let mut batch = Vec::new();
    let mut rest = VecDeque::with_capacity(pending.len());
    while let Some(item) = pending.pop_front() {
        if batch.len() < limit && item.is_ready(now) {
            batch.push(item);
        } else {
            rest.push_back(item);
        }
    }
    *pending = rest;
    batch
}

/// Delay until the earliest backing-off item is ready, `None` when any item
/// is ready now.
fn backoff_wait(pending: &VecDeque<QueueItem>) -> Option<Duration> {
    let now = Instant::now();
    let mut earliest: Option<Instant> = None;
    for item in pending {
        match item.ready_at {
            None => return None,
            Some(at) if at <= now => return None,
            Some(at) => {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }
    }
    earliest.map(|at| at.saturating_duration_since(now))
}
