//! Ignore patterns and file eligibility.
//!
//! Two layers of filtering run before a file is ever fingerprinted: glob
//! ignore patterns (junk files, caches, recycle bins) and the eligibility
//! filter (extension allow-list, size ceiling). Both match against the
//! forward-slash relative path.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// Junk that no deployment wants to ingest. Configured patterns are added on
/// top of these.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/.DS_Store",
    "**/Thumbs.db",
    "**/desktop.ini",
    "**/~$*",
    "**/*.tmp",
    "**/*.temp",
    "**/.Trash-*/**",
    "**/System Volume Information/**",
    "**/$RECYCLE.BIN/**",
];

#[derive(Debug, Error)]
#[error("invalid glob pattern '{pattern}': {message}")]
pub struct PatternError {
    pub pattern: String,
    pub message: String,
}

/// Normalize a raw glob so bare names match at any depth.
///
/// "*.tmp" means "any .tmp anywhere", so patterns without a path separator
/// get a `**/` prefix; leading slashes are stripped because matching is
/// always relative.
fn normalize_glob(raw: &str) -> String {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed == "*" {
        return "**/*".to_string();
    }
    if trimmed.contains('/') || trimmed.starts_with("**") {
        trimmed.to_string()
    } else {
        format!("**/{trimmed}")
    }
}

/// A compiled set of ignore globs.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreSet {
    /// Compile a set of raw patterns. Case-insensitive, like the network
    /// filesystems these paths usually come from.
    pub fn compile<I, S>(raw: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for raw in raw {
            let normalized = normalize_glob(raw.as_ref());
            let glob = GlobBuilder::new(&normalized)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|e| PatternError {
                    pattern: raw.as_ref().to_string(),
                    message: e.to_string(),
                })?;
            builder.add(glob);
            patterns.push(normalized);
        }
        let set = builder.build().map_err(|e| PatternError {
            pattern: String::new(),
            message: e.to_string(),
        })?;
        Ok(Self { patterns, set })
    }

    /// The built-in junk patterns plus the given extras.
    pub fn with_defaults<I, S>(extra: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw: Vec<String> = DEFAULT_IGNORE_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .chain(extra.into_iter().map(|s| s.as_ref().to_string()))
            .collect();
        Self::compile(raw)
    }

    /// An ignore set that matches nothing.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path.trim_start_matches('/'))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

/// Eligibility filter applied after ignore patterns.
///
/// `None` fields mean "no restriction".
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// Lowercase extensions including the dot, e.g. ".pdf".
    pub extensions: Option<Vec<String>>,
    pub max_size_bytes: Option<u64>,
}

impl FileFilter {
    pub fn new(extensions: Option<Vec<String>>, max_size_bytes: Option<u64>) -> Self {
        let extensions = extensions.map(|exts| {
            exts.into_iter()
                .map(|e| {
                    let e = e.trim().to_lowercase();
                    if e.starts_with('.') {
                        e
                    } else {
                        format!(".{e}")
                    }
                })
                .collect()
        });
        Self {
            extensions,
            max_size_bytes,
        }
    }

    /// Whether a file at `rel_path` with the given size (when known) should
    /// be reported. Unknown sizes pass the size check; they are re-examined
    /// once a fingerprint is readable.
    pub fn allows(&self, rel_path: &str, size_bytes: Option<u64>) -> bool {
        if let Some(extensions) = &self.extensions {
            let ext = extension_of(rel_path);
            if !extensions.iter().any(|allowed| *allowed == ext) {
                return false;
            }
        }
        if let (Some(max), Some(size)) = (self.max_size_bytes, size_bytes) {
            if size > max {
                return false;
            }
        }
        true
    }
}

fn extension_of(rel_path: &str) -> String {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}
