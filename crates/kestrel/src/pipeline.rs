//! Pipeline supervision: mounts, watchers, bus, and drain loop.
//!
//! One task per active target plus the queue drain loop, all talking
//! through the bounded bus. Startup order follows the storage chain: mounts
//! come up before the watchers that read them; shutdown runs in reverse:
//! watchers stop first (finishing their tick), then the queue drains its
//! in-flight batch, then mounts this process created are released.
//!
//! A target that fails to start is reported and skipped; the others keep
//! running. One bad share never halts ingestion from healthy targets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kestrel_ingest::{
    DedupConfig, DrainReport, EventBus, IngestionQueue, Processor, QueueConfig,
};
use kestrel_mount::{MountManager, MountManagerConfig, Mounter, ShellMounter};
use kestrel_types::{CancelToken, TargetKind, WatchTarget};
use kestrel_watch::{
    DirShareClient, LocalWatcher, LocalWatcherConfig, MountedPollWatcher, ProtocolPollConfig,
    ProtocolPollWatcher, ShareClient, WatcherHandle,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;

/// Builds a protocol connection for a share target. The default factory
/// serves directory URIs through [`DirShareClient`]; real protocol
/// connectors are supplied by the embedder.
pub type ShareClientFactory =
    Box<dyn Fn(&WatchTarget) -> Option<Box<dyn ShareClient>> + Send + Sync>;

/// How a run ended.
#[derive(Debug)]
pub enum ShutdownOutcome {
    /// Queue drained within the grace period.
    Drained(DrainReport),
    /// Grace period expired with work still queued.
    TimedOut,
}

pub struct Pipeline {
    watchers: Vec<WatcherHandle>,
    watcher_cancel: CancelToken,
    queue_cancel: CancelToken,
    queue_task: JoinHandle<DrainReport>,
    queue_depth: Arc<AtomicUsize>,
    status_task: JoinHandle<()>,
    health_tasks: Vec<JoinHandle<()>>,
    mount_manager: Arc<MountManager>,
    grace: Duration,
}

impl Pipeline {
    /// Bring up mounts, watchers, and the drain loop.
    pub async fn start(
        config: &Config,
        processor: Arc<dyn Processor>,
    ) -> anyhow::Result<Self> {
        let mounter: Arc<dyn Mounter> = Arc::new(ShellMounter::new(
            config.mount.mount_root.clone(),
            Duration::from_secs(config.mount.mount_timeout_secs),
        ));
        Self::start_with(config, processor, mounter, default_share_factory()).await
    }

    /// Startup with injectable mounter and share-connector factory.
    pub async fn start_with(
        config: &Config,
        processor: Arc<dyn Processor>,
        mounter: Arc<dyn Mounter>,
        share_factory: ShareClientFactory,
    ) -> anyhow::Result<Self> {
        let targets = config.build_targets()?;

        let mut bus = EventBus::new(
            config.pipeline.queue_capacity,
            DedupConfig {
                window: config.dedup_window(),
                max_entries: config.pipeline.dedup_max_entries,
            },
        );
        let events = bus
            .subscribe()
            .expect("freshly created bus has its receiver");

        let queue = IngestionQueue::new(
            QueueConfig {
                batch_size: config.pipeline.batch_size,
                processing_delay: config.processing_delay(),
                max_attempts: config.pipeline.max_attempts,
                retry_backoff: Duration::from_secs(1),
            },
            events,
            processor,
        );
        let queue_cancel = queue.shutdown_token();
        let queue_depth = queue.depth_gauge();
        let queue_task = tokio::spawn(queue.drain_loop());

        let mount_manager = Arc::new(MountManager::new(
            mounter,
            MountManagerConfig {
                health_interval: Duration::from_secs(config.mount.health_interval_secs),
                health_timeout: Duration::from_secs(config.mount.health_timeout_secs),
                reconnect_attempts: config.pipeline.reconnect_attempts,
            },
        ));

        let watcher_cancel = CancelToken::new();
        let mut watchers = Vec::new();
        let mut health_tasks = Vec::new();

        for target in targets {
            match target.kind {
                TargetKind::Local => {
                    let watcher = LocalWatcher::new(
                        target,
                        bus.publisher(),
                        LocalWatcherConfig {
                            stability_window: config.stability_window(),
                            ..LocalWatcherConfig::default()
                        },
                    );
                    watchers.push(watcher.spawn(watcher_cancel.clone()));
                }
                TargetKind::ProtocolShare => match share_factory(&target) {
                    Some(client) => {
                        let watcher = ProtocolPollWatcher::new(
                            target,
                            client,
                            bus.publisher(),
                            ProtocolPollConfig {
                                reconnect_attempts: config.pipeline.reconnect_attempts,
                                reconnect_backoff: config.reconnect_backoff(),
                            },
                        );
                        watchers.push(watcher.spawn(watcher_cancel.clone()));
                    }
                    None => {
                        error!(
                            target_id = %target.id,
                            uri = %target.uri,
                            "no protocol connector available for target; target disabled"
                        );
                    }
                },
                TargetKind::OsMount => match mount_manager.mount(&target).await {
                    Ok(handle) => {
                        health_tasks.push(tokio::spawn(Arc::clone(&mount_manager).health_loop(
                            target.clone(),
                            Arc::clone(&handle),
                            watcher_cancel.clone(),
                        )));
                        let watcher =
                            MountedPollWatcher::new(target, handle, bus.publisher());
                        watchers.push(watcher.spawn(watcher_cancel.clone()));
                    }
                    Err(err) => {
                        // Unusable until network or configuration changes;
                        // surfaced for the operator and retried on a much
                        // longer backoff than scan ticks. Other targets
                        // continue.
                        error!(
                            target_id = %target.id,
                            uri = %target.uri,
                            error = %err,
                            "mount failed; target unusable, will retry on long backoff"
                        );
                        let retry_backoff =
                            Duration::from_secs(config.mount.health_interval_secs) * 4;
                        health_tasks.push(tokio::spawn(mount_retry_loop(
                            Arc::clone(&mount_manager),
                            target,
                            bus.publisher(),
                            watcher_cancel.clone(),
                            retry_backoff,
                        )));
                    }
                },
            }
        }

        if watchers.is_empty() {
            warn!("no watcher could be started; the pipeline will sit idle");
        }

        let status_task = tokio::spawn(status_loop(
            watchers.len(),
            Arc::clone(&queue_depth),
            config.status_interval(),
            watcher_cancel.clone(),
        ));

        info!(
            targets = watchers.len(),
            queue_capacity = config.pipeline.queue_capacity,
            "pipeline started"
        );

        Ok(Self {
            watchers,
            watcher_cancel,
            queue_cancel,
            queue_task,
            queue_depth,
            status_task,
            health_tasks,
            mount_manager,
            grace: config.shutdown_grace(),
        })
    }

    /// Items currently waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Cooperative shutdown: stop discovery, drain the queue within the
    /// grace period, release mounts.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        info!("shutdown requested; stopping watchers");
        self.watcher_cancel.cancel();
        for watcher in self.watchers.drain(..) {
            let target_id = watcher.target_id().clone();
            if let Err(err) = watcher.join().await {
                error!(target_id = %target_id, error = %err, "watcher ended with error");
            }
        }
        self.status_task.abort();
        for task in self.health_tasks.drain(..) {
            task.abort();
        }

        self.queue_cancel.cancel();
        let outcome = match tokio::time::timeout(self.grace, &mut self.queue_task).await {
            Ok(Ok(report)) => {
                info!(
                    delivered = report.delivered,
                    residual = report.residual,
                    "queue drained within grace period"
                );
                ShutdownOutcome::Drained(report)
            }
            Ok(Err(join_err)) => {
                error!(error = %join_err, "queue task failed");
                ShutdownOutcome::TimedOut
            }
            Err(_) => {
                warn!(grace_secs = self.grace.as_secs(), "drain did not finish within grace period");
                self.queue_task.abort();
                ShutdownOutcome::TimedOut
            }
        };

        self.mount_manager.unmount_all().await;
        outcome
    }
}

/// The default connector: a protocol-share URI that is actually a reachable
/// directory is served through the directory-backed reference client.
pub fn default_share_factory() -> ShareClientFactory {
    Box::new(|target: &WatchTarget| {
        let path = std::path::Path::new(&target.uri);
        if path.is_dir() {
            Some(Box::new(DirShareClient::new(path)) as Box<dyn ShareClient>)
        } else {
            None
        }
    })
}

/// Long-backoff retry for a target whose mount failed at startup. Once the
/// share comes back, the watcher and health loop come up exactly as they
/// would have at startup.
async fn mount_retry_loop(
    manager: Arc<MountManager>,
    target: WatchTarget,
    publisher: kestrel_ingest::EventPublisher,
    cancel: CancelToken,
    backoff: Duration,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        match manager.mount(&target).await {
            Ok(handle) => {
                info!(target_id = %target.id, "deferred mount succeeded; starting watcher");
                tokio::spawn(Arc::clone(&manager).health_loop(
                    target.clone(),
                    Arc::clone(&handle),
                    cancel.clone(),
                ));
                let watcher = MountedPollWatcher::new(target, handle, publisher);
                let handle = watcher.spawn(cancel.clone());
                if let Err(err) = handle.join().await {
                    error!(error = %err, "deferred watcher ended with error");
                }
                return;
            }
            Err(err) => {
                warn!(
                    target_id = %target.id,
                    error = %err,
                    backoff_secs = backoff.as_secs(),
                    "mount retry failed"
                );
            }
        }
    }
}

/// Periodic one-line summary of pipeline health.
async fn status_loop(
    targets: usize,
    queue_depth: Arc<AtomicUsize>,
    interval: Duration,
    cancel: CancelToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        info!(
            targets,
            queue_depth = queue_depth.load(Ordering::Relaxed),
            "pipeline status"
        );
    }
}
