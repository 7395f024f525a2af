//! Platform mount operations behind a trait seam.
//!
//! [`ShellMounter`] drives the operating system's own tooling (`mount` on
//! unix, `net use` on windows) and parses its output for the mount table.
//! The mount table, not process memory, is the source of truth for "is this
//! share already mapped": the process may have restarted since the mapping
//! was made.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kestrel_types::Credentials;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::MountError;

/// One line of the OS mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTableEntry {
    /// Canonical `//host/share` endpoint.
    pub endpoint: String,
    pub mount_point: PathBuf,
}

/// Everything needed to map one share.
#[derive(Debug, Clone)]
pub struct MountRequest {
    pub endpoint: String,
    pub mount_point: PathBuf,
    pub credentials: Option<Credentials>,
}

/// Side-effecting mount operations. Implemented by [`ShellMounter`] for real
/// systems and by fakes in tests.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Current network-share entries of the OS mount table.
    async fn mount_table(&self) -> Result<Vec<MountTableEntry>, MountError>;

    /// Map `endpoint` at `mount_point`.
    async fn mount(&self, request: &MountRequest) -> Result<(), MountError>;

    /// Unmap a mount point. "Not mounted" is success: the mapping is gone
    /// either way.
    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError>;

    /// Cheap reachability probe of the share host, run before any mount
    /// attempt so an unplugged network fails fast with a typed error.
    async fn probe_host(&self, host: &str) -> bool;

    /// Pick an unused local mount identifier, given the identifiers the
    /// mount table already occupies.
    async fn allocate_slot(&self, used: &[MountTableEntry]) -> Result<PathBuf, MountError>;
}

/// Canonicalize share URIs to `//host/share`.
///
/// Accepts `smb://host/share`, `//host/share` and `\\host\share` forms;
/// user-info in the URI is discarded (credentials travel separately and are
/// never logged).
pub fn normalize_endpoint(uri: &str) -> Result<String, MountError> {
    let trimmed = uri.trim();
    let without_scheme = trimmed
        .strip_prefix("smb://")
        .or_else(|| trimmed.strip_prefix("cifs://"))
        .or_else(|| trimmed.strip_prefix("//"))
        .or_else(|| trimmed.strip_prefix(r"\\"))
        .ok_or_else(|| MountError::InvalidUri { uri: uri.to_string() })?;
    let without_scheme = without_scheme.replace('\\', "/");

    // Drop any user-info segment before the host.
    let host_and_path = match without_scheme.rfind('@') {
        Some(idx) => &without_scheme[idx + 1..],
        None => without_scheme.as_str(),
    };

    let mut parts = host_and_path.splitn(2, '/');
    let host = parts.next().unwrap_or_default();
    let share = parts.next().unwrap_or_default().trim_end_matches('/');
    if host.is_empty() || share.is_empty() {
        return Err(MountError::InvalidUri { uri: uri.to_string() });
    }
    Ok(format!("//{}/{}", host.to_lowercase(), share))
}

/// Host component of a canonical endpoint.
pub fn endpoint_host(endpoint: &str) -> Option<&str> {
    endpoint
        .strip_prefix("//")
        .and_then(|rest| rest.split('/').next())
        .filter(|host| !host.is_empty())
}

/// Drives the platform's own mount tooling.
pub struct ShellMounter {
    mount_root: PathBuf,
    mount_timeout: Duration,
}

/// Upper bound of mount points allocated under the mount root.
const MAX_MOUNT_SLOTS: usize = 64;

impl ShellMounter {
    pub fn new(mount_root: PathBuf, mount_timeout: Duration) -> Self {
        Self {
            mount_root,
            mount_timeout,
        }
    }

    async fn run(&self, operation: &str, command: &mut Command) -> Result<String, MountError> {
        let output = tokio::time::timeout(self.mount_timeout, command.output())
            .await
            .map_err(|_| MountError::CommandFailed {
                operation: operation.to_string(),
                detail: format!("timed out after {:?}", self.mount_timeout),
            })??;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            Err(classify_failure(operation, &stderr))
        }
    }
}

/// Map tool output onto the error taxonomy.
fn classify_failure(operation: &str, stderr: &str) -> MountError {
    let lower = stderr.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("logon failure")
        || lower.contains("authentication")
    {
        MountError::AuthRejected {
            endpoint: operation.to_string(),
        }
    } else if lower.contains("no route to host")
        || lower.contains("could not resolve")
        || lower.contains("host is down")
        || lower.contains("network is unreachable")
        || lower.contains("network path was not found")
    {
        MountError::HostUnreachable {
            host: operation.to_string(),
        }
    } else if lower.contains("no such file")
        || lower.contains("bad_network_name")
        || lower.contains("network name cannot be found")
    {
        MountError::ShareNotFound {
            endpoint: operation.to_string(),
        }
    } else {
        MountError::CommandFailed {
            operation: operation.to_string(),
            detail: stderr.trim().to_string(),
        }
    }
}

/// Parse unix `mount` output lines like
/// `//host/share on /mnt/kestrel/slot0 (cifs, ...)`.
#[cfg(any(unix, test))]
fn parse_unix_mount_table(output: &str) -> Vec<MountTableEntry> {
    output
        .lines()
        .filter_map(|line| {
            let (device, rest) = line.split_once(" on ")?;
            let device = device.trim();
            if !device.starts_with("//") {
                return None;
            }
            let mount_point = rest
                .split(" type ")
                .next()
                .unwrap_or(rest)
                .split(" (")
                .next()
                .unwrap_or(rest)
                .trim();
            Some(MountTableEntry {
                endpoint: device.to_lowercase(),
                mount_point: PathBuf::from(mount_point),
            })
        })
        .collect()
}

/// Parse `net use` output lines like
/// `OK           Z:        \\host\share              Microsoft Windows Network`.
#[cfg(any(windows, test))]
fn parse_net_use_table(output: &str) -> Vec<MountTableEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _status = fields.next()?;
            let letter = fields.next()?;
            let remote = fields.next()?;
            if !letter.ends_with(':') || !remote.starts_with(r"\\") {
                return None;
            }
            Some(MountTableEntry {
                endpoint: remote.replace('\\', "/").to_lowercase(),
                mount_point: PathBuf::from(letter),
            })
        })
        .collect()
}

#[cfg(unix)]
#[async_trait]
impl Mounter for ShellMounter {
    async fn mount_table(&self) -> Result<Vec<MountTableEntry>, MountError> {
        let output = self.run("mount table", &mut Command::new("mount")).await?;
        Ok(parse_unix_mount_table(&output))
    }

    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        tokio::fs::create_dir_all(&request.mount_point).await?;

        let source = request.endpoint.clone();
        let mut command = Command::new("mount");
        #[cfg(target_os = "macos")]
        command.arg("-t").arg("smbfs");
        #[cfg(not(target_os = "macos"))]
        command.arg("-t").arg("cifs");

        if let Some(credentials) = &request.credentials {
            let mut options = format!(
                "username={},password={}",
                credentials.username,
                credentials.password.reveal()
            );
            if let Some(domain) = &credentials.domain {
                options.push_str(&format!(",domain={domain}"));
            }
            command.arg("-o").arg(options);
        }
        command.arg(&source).arg(&request.mount_point);

        debug!(endpoint = %request.endpoint, mount_point = %request.mount_point.display(), "mounting share");
        self.run(&request.endpoint, &mut command).await?;
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        let mut command = Command::new("umount");
        command.arg(mount_point);
        match self.run("unmount", &mut command).await {
            Ok(_) => Ok(()),
            Err(MountError::CommandFailed { detail, .. })
                if detail.to_lowercase().contains("not mounted")
                    || detail.to_lowercase().contains("not currently mounted") =>
            {
                debug!(mount_point = %mount_point.display(), "already unmounted");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn probe_host(&self, host: &str) -> bool {
        let mut command = Command::new("ping");
        command.arg("-c").arg("1").arg("-W").arg("3").arg(host);
        match command.output().await {
            Ok(output) => output.status.success(),
            Err(err) => {
                warn!(host, error = %err, "reachability probe could not run");
                // Without a probe tool, let the mount attempt decide.
                true
            }
        }
    }

    async fn allocate_slot(&self, used: &[MountTableEntry]) -> Result<PathBuf, MountError> {
        for index in 0..MAX_MOUNT_SLOTS {
            let candidate = self.mount_root.join(format!("slot{index}"));
            if !used.iter().any(|entry| entry.mount_point == candidate) {
                return Ok(candidate);
            }
        }
        Err(MountError::NoMountSlotAvailable)
    }
}

#[cfg(windows)]
#[async_trait]
impl Mounter for ShellMounter {
    async fn mount_table(&self) -> Result<Vec<MountTableEntry>, MountError> {
        let output = self.run("mount table", Command::new("net").arg("use")).await?;
        Ok(parse_net_use_table(&output))
    }

    async fn mount(&self, request: &MountRequest) -> Result<(), MountError> {
        let unc = request.endpoint.replace('/', "\\");
        let mut command = Command::new("net");
        command
            .arg("use")
            .arg(request.mount_point.as_os_str())
            .arg(&unc);
        if let Some(credentials) = &request.credentials {
            command.arg(credentials.password.reveal());
            let user = match &credentials.domain {
                Some(domain) => format!("/user:{domain}\\{}", credentials.username),
                None => format!("/user:{}", credentials.username),
            };
            command.arg(user);
        }
        debug!(endpoint = %request.endpoint, mount_point = %request.mount_point.display(), "mapping drive");
        self.run(&request.endpoint, &mut command).await?;
        Ok(())
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), MountError> {
        let mut command = Command::new("net");
        command
            .arg("use")
            .arg(mount_point.as_os_str())
            .arg("/delete")
            .arg("/y");
        match self.run("unmount", &mut command).await {
            Ok(_) => Ok(()),
            Err(MountError::CommandFailed { detail, .. })
                if detail.to_lowercase().contains("connection could not be found") =>
            {
                debug!(mount_point = %mount_point.display(), "already disconnected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn probe_host(&self, host: &str) -> bool {
        let mut command = Command::new("ping");
        command.arg("-n").arg("1").arg("-w").arg("3000").arg(host);
        match command.output().await {
            Ok(output) => output.status.success(),
            Err(err) => {
                warn!(host, error = %err, "reachability probe could not run");
                true
            }
        }
    }

    async fn allocate_slot(&self, used: &[MountTableEntry]) -> Result<PathBuf, MountError> {
        // Z: downwards, leaving the low letters to physical drives.
        for letter in ('D'..='Z').rev() {
            let candidate = PathBuf::from(format!("{letter}:"));
            if !used.iter().any(|entry| entry.mount_point == candidate) {
                return Ok(candidate);
            }
        }
        Err(MountError::NoMountSlotAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_accepts_common_forms() {
        for uri in [
            "smb://fileserver/Projects",
            "//fileserver/Projects",
            r"\\fileserver\Projects",
            "smb://corp;svc@fileserver/Projects",
        ] {
            assert_eq!(normalize_endpoint(uri).unwrap(), "//fileserver/projects");
        }
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(matches!(
            normalize_endpoint("just-a-word"),
            Err(MountError::InvalidUri { .. })
        ));
        assert!(matches!(
            normalize_endpoint("//hostonly"),
            Err(MountError::InvalidUri { .. })
        ));
    }

    #[test]
    fn endpoint_host_extraction() {
        assert_eq!(endpoint_host("//nas01/shared"), Some("nas01"));
        assert_eq!(endpoint_host("not-an-endpoint"), None);
    }

    #[test]
    fn parses_unix_mount_table() {
        let output = "\
/dev/sda1 on / type ext4 (rw,relatime)\n\
//nas01/shared on /mnt/kestrel/slot0 type cifs (rw,relatime)\n\
//nas02/archive on /mnt/kestrel/slot1 (smbfs)\n";
        let table = parse_unix_mount_table(output);
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].endpoint, "//nas01/shared");
        assert_eq!(table[0].mount_point, PathBuf::from("/mnt/kestrel/slot0"));
        assert_eq!(table[1].endpoint, "//nas02/archive");
    }

    #[test]
    fn parses_net_use_table() {
        let output = "\
New connections will be remembered.\n\
\n\
Status       Local     Remote                    Network\n\
-------------------------------------------------------------------------------\n\
OK           Z:        \\\\nas01\\shared            Microsoft Windows Network\n";
        let table = parse_net_use_table(output);
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].endpoint, "//nas01/shared");
        assert_eq!(table[0].mount_point, PathBuf::from("Z:"));
    }

    #[test]
    fn classifies_tool_failures() {
        assert!(matches!(
            classify_failure("x", "mount error(13): Permission denied"),
            MountError::AuthRejected { .. }
        ));
        assert!(matches!(
            classify_failure("x", "mount error(113): No route to host"),
            MountError::HostUnreachable { .. }
        ));
        assert!(matches!(
            classify_failure("x", "mount error(2): No such file or directory"),
            MountError::ShareNotFound { .. }
        ));
        assert!(matches!(
            classify_failure("x", "something else entirely"),
            MountError::CommandFailed { .. }
        ));
    }
}
