//! Event fan-in and reliable delivery.
//!
//! Watchers publish [`FileEvent`]s into the [`EventBus`], which deduplicates
//! within a short trailing window and applies backpressure through a bounded
//! channel. The [`IngestionQueue`] drains the bus in batches and hands each
//! item to the external [`Processor`], retrying failed deliveries up to a
//! configured ceiling.

pub mod bus;
pub mod processor;
pub mod queue;

pub use bus::{BusClosed, DedupConfig, EventBus, EventPublisher};
pub use processor::{ProcessingError, Processor};
pub use queue::{DrainReport, IngestionQueue, QueueConfig, QueueItem};
