//! Configuration loading and startup validation.
//!
//! Everything a run needs comes from one toml file. Validation happens
//! before anything spawns: a contradiction like a batch larger than the
//! queue capacity is a configuration error at startup, never a runtime
//! surprise.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use kestrel_types::{
    Credentials, FileFilter, IgnoreSet, Secret, TargetId, TargetKind, WatchTarget,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("no watch targets configured")]
    NoTargets,

    #[error("duplicate target id '{0}'")]
    DuplicateTargetId(String),

    #[error("target '{target}': {message}")]
    InvalidTarget { target: String, message: String },

    #[error("{0}")]
    Invalid(String),

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] kestrel_types::PatternError),
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    10
}

fn default_processing_delay_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_queue_capacity() -> usize {
    256
}

fn default_dedup_window_secs() -> u64 {
    10
}

fn default_dedup_max_entries() -> usize {
    1_024
}

fn default_stability_window_ms() -> u64 {
    2_000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_backoff_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_status_interval_secs() -> u64 {
    60
}

fn default_max_file_size_bytes() -> Option<u64> {
    Some(10 * 1024 * 1024)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
    /// Extra ignore globs applied to every target, on top of the built-in
    /// junk patterns.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    /// Extension allow-list; empty means every extension.
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: Option<u64>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            processing_delay_ms: default_processing_delay_ms(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
            dedup_window_secs: default_dedup_window_secs(),
            dedup_max_entries: default_dedup_max_entries(),
            stability_window_ms: default_stability_window_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            status_interval_secs: default_status_interval_secs(),
            ignore_patterns: Vec::new(),
            extensions: Vec::new(),
            max_file_size_bytes: default_max_file_size_bytes(),
        }
    }
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/kestrel")
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_health_timeout_secs() -> u64 {
    10
}

fn default_mount_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountSettings {
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_mount_timeout_secs")]
    pub mount_timeout_secs: u64,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_root: default_mount_root(),
            health_interval_secs: default_health_interval_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            mount_timeout_secs: default_mount_timeout_secs(),
        }
    }
}

fn default_spool_path() -> PathBuf {
    PathBuf::from("kestrel-events.jsonl")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSettings {
    /// Where the JSONL sink appends delivered events.
    #[serde(default = "default_spool_path")]
    pub spool_path: PathBuf,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            spool_path: default_spool_path(),
        }
    }
}

fn default_recursive() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Stable identifier; generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub uri: String,
    pub kind: TargetKind,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    /// Per-target override of the global poll interval.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Per-target ignore globs, added to the global set.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub mount: MountSettings,
    #[serde(default)]
    pub sink: SinkSettings,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictions before anything spawns.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        let p = &self.pipeline;
        if p.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if p.queue_capacity < p.batch_size {
            // Backpressure only works when the bounded channel can hold a
            // full batch; anything smaller would overflow at the first
            // drain round.
            return Err(ConfigError::Invalid(format!(
                "queue_capacity ({}) must be at least batch_size ({})",
                p.queue_capacity, p.batch_size
            )));
        }
        if p.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if p.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be nonzero".into()));
        }
        if p.stability_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "stability_window_ms must be nonzero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if let Some(id) = &target.id {
                if !seen.insert(id.clone()) {
                    return Err(ConfigError::DuplicateTargetId(id.clone()));
                }
            }
            if target.uri.trim().is_empty() {
                return Err(ConfigError::InvalidTarget {
                    target: target.id.clone().unwrap_or_else(|| "<unnamed>".into()),
                    message: "uri must not be empty".into(),
                });
            }
            if let Some(interval) = target.poll_interval_ms {
                if interval == 0 {
                    return Err(ConfigError::InvalidTarget {
                        target: target.id.clone().unwrap_or_else(|| "<unnamed>".into()),
                        message: "poll_interval_ms must be nonzero".into(),
                    });
                }
            }
            if target.password.is_some() && target.username.is_none() {
                return Err(ConfigError::InvalidTarget {
                    target: target.id.clone().unwrap_or_else(|| "<unnamed>".into()),
                    message: "password configured without username".into(),
                });
            }
            // Globs must compile; building the set performs the check.
            IgnoreSet::with_defaults(
                self.pipeline
                    .ignore_patterns
                    .iter()
                    .chain(target.ignore_patterns.iter()),
            )?;
        }
        Ok(())
    }

    /// Materialize immutable watch targets from the configuration.
    pub fn build_targets(&self) -> Result<Vec<WatchTarget>, ConfigError> {
        let filter = FileFilter::new(
            if self.pipeline.extensions.is_empty() {
                None
            } else {
                Some(self.pipeline.extensions.clone())
            },
            self.pipeline.max_file_size_bytes,
        );

        self.targets
            .iter()
            .map(|target| {
                let ignore = IgnoreSet::with_defaults(
                    self.pipeline
                        .ignore_patterns
                        .iter()
                        .chain(target.ignore_patterns.iter()),
                )?;
                let credentials = target.username.as_ref().map(|username| Credentials {
                    username: username.clone(),
                    password: Secret::new(target.password.clone().unwrap_or_default()),
                    domain: target.domain.clone(),
                });
                Ok(WatchTarget {
                    id: target
                        .id
                        .as_ref()
                        .map(TargetId::new)
                        .unwrap_or_else(TargetId::generate),
                    uri: target.uri.clone(),
                    kind: target.kind,
                    credentials,
                    recursive: target.recursive,
                    poll_interval: Duration::from_millis(
                        target
                            .poll_interval_ms
                            .unwrap_or(self.pipeline.poll_interval_ms),
                    ),
                    ignore,
                    filter: filter.clone(),
                })
            })
            .collect()
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.pipeline.processing_delay_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.pipeline.stability_window_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.pipeline.dedup_window_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.pipeline.reconnect_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.pipeline.shutdown_grace_secs)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline.status_interval_secs)
    }
}
