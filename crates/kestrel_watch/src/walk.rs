//! Blocking recursive walk shared by the local and mounted watchers.

use std::path::Path;

use kestrel_types::path::normalize_rel_path;
use kestrel_types::{FileFilter, FileFingerprint, IgnoreSet};
use tracing::debug;

use crate::state::Observation;

/// Result of one walk pass.
pub struct WalkOutcome {
    pub observations: Vec<Observation>,
    /// Unreadable directories encountered. A walk with errors must not be
    /// reconciled: a subtree that failed to enumerate would read as deleted.
    pub errors: usize,
}

/// Enumerate every eligible file under `root`, relative forward-slash paths.
///
/// Blocking; run it on a blocking-capable thread. Symlinks are not followed.
pub fn walk_observations(
    root: &Path,
    recursive: bool,
    ignore: &IgnoreSet,
    filter: &FileFilter,
) -> WalkOutcome {
    let mut walker = walkdir::WalkDir::new(root).follow_links(false);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut observations = Vec::new();
    let mut errors = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "walk error");
                errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = match entry.path().strip_prefix(root) {
            Ok(rel) => normalize_rel_path(rel),
            Err(_) => continue,
        };
        if ignore.is_ignored(&rel_path) {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => {
                let size = metadata.len();
                if !filter.allows(&rel_path, Some(size)) {
                    debug!(path = %rel_path, size, "file skipped by eligibility filter");
                    continue;
                }
                match FileFingerprint::from_metadata(&metadata) {
                    Some(fingerprint) => {
                        observations.push(Observation::new(rel_path, fingerprint))
                    }
                    None => observations.push(Observation::unreadable(rel_path)),
                }
            }
            Err(_) => {
                if !filter.allows(&rel_path, None) {
                    continue;
                }
                observations.push(Observation::unreadable(rel_path));
            }
        }
    }

    WalkOutcome {
        observations,
        errors,
    }
}
