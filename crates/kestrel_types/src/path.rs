//! Relative-path helpers.
//!
//! Every path that crosses a crate boundary is relative to its target root
//! and uses forward slashes, so that cache keys and event payloads compare
//! equal across platforms and transport kinds.

use std::path::Path;

/// Render a path with forward slashes regardless of platform.
pub fn normalize_rel_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a relative directory and an entry name into a relative path.
pub fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalizes_to_forward_slashes() {
        let p: PathBuf = ["reports", "2026", "q3.xlsx"].iter().collect();
        assert_eq!(normalize_rel_path(&p), "reports/2026/q3.xlsx");
    }

    #[test]
    fn join_rel_handles_root() {
        assert_eq!(join_rel("", "a.txt"), "a.txt");
        assert_eq!(join_rel("sub", "a.txt"), "sub/a.txt");
        assert_eq!(join_rel("sub/", "a.txt"), "sub/a.txt");
    }
}
