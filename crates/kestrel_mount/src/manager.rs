//! Mount lifecycle management.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kestrel_types::{CancelToken, TargetId, WatchTarget};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::MountError;
use crate::mounter::{endpoint_host, normalize_endpoint, MountRequest, Mounter};

/// Connection state of one mounted share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Connecting,
    Healthy,
    /// Health check failed; reconnection in progress, dependent watchers
    /// pause their ticks.
    Degraded,
    /// Reconnection gave up; retried on a long backoff.
    Disconnected,
}

impl MountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Healthy,
            2 => Self::Degraded,
            _ => Self::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Healthy => 1,
            Self::Degraded => 2,
            Self::Disconnected => 3,
        }
    }
}

impl std::fmt::Display for MountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live mapping of a share to a local mount point.
///
/// Shared for reading by watchers; only the [`MountManager`] transitions the
/// status (single-writer, multiple-reader by convention; mutation is
/// infrequent and limited to status).
#[derive(Debug)]
pub struct MountHandle {
    pub target_id: TargetId,
    pub endpoint: String,
    pub mount_point: PathBuf,
    pub connected_at: DateTime<Utc>,
    status: AtomicU8,
    last_health_check_ms: AtomicI64,
}

impl MountHandle {
    fn new(target_id: TargetId, endpoint: String, mount_point: PathBuf) -> Self {
        Self {
            target_id,
            endpoint,
            mount_point,
            connected_at: Utc::now(),
            status: AtomicU8::new(MountStatus::Healthy.as_u8()),
            last_health_check_ms: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> MountStatus {
        MountStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == MountStatus::Healthy
    }

    pub fn last_health_check_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.last_health_check_ms.load(Ordering::Acquire);
        if millis == 0 {
            return None;
        }
        Utc.timestamp_millis_opt(millis).single()
    }

    fn set_status(&self, status: MountStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    fn touch_health_check(&self) {
        self.last_health_check_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct MountManagerConfig {
    /// How often a mounted share is health-checked.
    pub health_interval: Duration,
    /// Budget for the metadata read used as the health probe.
    pub health_timeout: Duration,
    /// Remount attempts per degraded period before giving up as
    /// disconnected.
    pub reconnect_attempts: u32,
}

impl Default for MountManagerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
        }
    }
}

/// Establishes, verifies, and tears down share mounts. Owns credential
/// material for its targets and is the sole mutator of mount state.
pub struct MountManager {
    mounter: Arc<dyn Mounter>,
    config: MountManagerConfig,
    handles: Mutex<HashMap<TargetId, Arc<MountHandle>>>,
}

impl MountManager {
    pub fn new(mounter: Arc<dyn Mounter>, config: MountManagerConfig) -> Self {
        Self {
            mounter,
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Mount a target's share, or return the existing mapping.
    ///
    /// Idempotent against the OS mount table: an endpoint already mapped,
    /// whether by this process, a previous run, or the operator, is adopted
    /// rather than remounted.
    pub async fn mount(&self, target: &WatchTarget) -> Result<Arc<MountHandle>, MountError> {
        let endpoint = normalize_endpoint(&target.uri)?;

        let table = self.mounter.mount_table().await?;
        if let Some(existing) = table.iter().find(|entry| entry.endpoint == endpoint) {
            info!(
                target_id = %target.id,
                endpoint = %endpoint,
                mount_point = %existing.mount_point.display(),
                "share already mounted; adopting existing mapping"
            );
            let handle = Arc::new(MountHandle::new(
                target.id.clone(),
                endpoint,
                existing.mount_point.clone(),
            ));
            self.handles
                .lock()
                .await
                .insert(target.id.clone(), Arc::clone(&handle));
            return Ok(handle);
        }

        let host = endpoint_host(&endpoint)
            .ok_or_else(|| MountError::InvalidUri { uri: target.uri.clone() })?
            .to_string();
        if !self.mounter.probe_host(&host).await {
            return Err(MountError::HostUnreachable { host });
        }

        let mount_point = self.mounter.allocate_slot(&table).await?;
        let request = MountRequest {
            endpoint: endpoint.clone(),
            mount_point: mount_point.clone(),
            credentials: target.credentials.clone(),
        };
        self.mounter.mount(&request).await?;

        // Verify against the table rather than trusting the tool's exit
        // status alone.
        let table = self.mounter.mount_table().await?;
        if !table.iter().any(|entry| entry.endpoint == endpoint) {
            return Err(MountError::CommandFailed {
                operation: endpoint.clone(),
                detail: "mount verification failed: endpoint absent from mount table".to_string(),
            });
        }

        info!(
            target_id = %target.id,
            endpoint = %endpoint,
            mount_point = %mount_point.display(),
            "share mounted"
        );
        let handle = Arc::new(MountHandle::new(target.id.clone(), endpoint, mount_point));
        self.handles
            .lock()
            .await
            .insert(target.id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Tear down a mapping. Best-effort: an already-gone mount is logged and
    /// treated as success.
    pub async fn unmount(&self, handle: &MountHandle) -> Result<(), MountError> {
        let result = self.mounter.unmount(&handle.mount_point).await;
        match &result {
            Ok(()) => {
                info!(
                    target_id = %handle.target_id,
                    mount_point = %handle.mount_point.display(),
                    "share unmounted"
                );
                handle.set_status(MountStatus::Disconnected);
            }
            Err(err) => {
                warn!(
                    target_id = %handle.target_id,
                    mount_point = %handle.mount_point.display(),
                    error = %err,
                    "unmount failed"
                );
            }
        }
        self.handles.lock().await.remove(&handle.target_id);
        result
    }

    /// Whether the target's endpoint currently appears in the OS mount
    /// table.
    pub async fn is_mounted(&self, target: &WatchTarget) -> bool {
        let Ok(endpoint) = normalize_endpoint(&target.uri) else {
            return false;
        };
        match self.mounter.mount_table().await {
            Ok(table) => table.iter().any(|entry| entry.endpoint == endpoint),
            Err(err) => {
                warn!(error = %err, "mount table inspection failed");
                false
            }
        }
    }

    /// Unmount everything this manager still tracks.
    pub async fn unmount_all(&self) {
        let handles: Vec<Arc<MountHandle>> =
            self.handles.lock().await.values().cloned().collect();
        for handle in handles {
            let _ = self.unmount(&handle).await;
        }
    }

    /// Periodic health checking for one handle, until cancelled.
    ///
    /// A failed metadata read degrades the handle; remount attempts then run
    /// each round until either recovery (healthy again) or the attempt
    /// budget is spent (disconnected, after which checks continue on a
    /// stretched interval).
    pub async fn health_loop(
        self: Arc<Self>,
        target: WatchTarget,
        handle: Arc<MountHandle>,
        cancel: CancelToken,
    ) {
        let base = self.config.health_interval;
        loop {
            let interval = if handle.status() == MountStatus::Disconnected {
                // Long backoff for targets the network has given up on.
                base * 4
            } else {
                base
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.health_check(&target, &handle).await;
        }
    }

    async fn health_check(&self, target: &WatchTarget, handle: &MountHandle) {
        handle.touch_health_check();
        let probe = tokio::time::timeout(
            self.config.health_timeout,
            tokio::fs::metadata(&handle.mount_point),
        )
        .await;

        match probe {
            Ok(Ok(_)) => {
                if handle.status() != MountStatus::Healthy {
                    info!(
                        target_id = %handle.target_id,
                        mount_point = %handle.mount_point.display(),
                        "mount recovered"
                    );
                }
                handle.set_status(MountStatus::Healthy);
            }
            Ok(Err(err)) => {
                self.degrade_and_reconnect(target, handle, &err.to_string()).await;
            }
            Err(_) => {
                self.degrade_and_reconnect(target, handle, "metadata read timed out").await;
            }
        }
    }

    async fn degrade_and_reconnect(&self, target: &WatchTarget, handle: &MountHandle, reason: &str) {
        warn!(
            target_id = %handle.target_id,
            mount_point = %handle.mount_point.display(),
            reason,
            "mount degraded"
        );
        handle.set_status(MountStatus::Degraded);

        for attempt in 1..=self.config.reconnect_attempts {
            debug!(
                target_id = %handle.target_id,
                attempt,
                "attempting remount"
            );
            // Clear any stale mapping first; failure here is non-fatal.
            let _ = self.mounter.unmount(&handle.mount_point).await;
            let request = MountRequest {
                endpoint: handle.endpoint.clone(),
                mount_point: handle.mount_point.clone(),
                credentials: target.credentials.clone(),
            };
            match self.mounter.mount(&request).await {
                Ok(()) => {
                    info!(
                        target_id = %handle.target_id,
                        mount_point = %handle.mount_point.display(),
                        attempt,
                        "remount succeeded"
                    );
                    handle.set_status(MountStatus::Healthy);
                    return;
                }
                Err(err) => {
                    warn!(
                        target_id = %handle.target_id,
                        attempt,
                        error = %err,
                        "remount failed"
                    );
                }
            }
        }
        warn!(
            target_id = %handle.target_id,
            attempts = self.config.reconnect_attempts,
            "reconnect attempts exhausted; mount disconnected"
        );
        handle.set_status(MountStatus::Disconnected);
    }
}
