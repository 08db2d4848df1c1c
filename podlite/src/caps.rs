//! Host capability queries.
//!
//! Spec generation asks the host a handful of questions: whether we run
//! rootless, whether SELinux labels apply, which cgroup we live in. They
//! sit behind [`HostCapabilities`] so tests can answer them without a
//! real host.

use std::collections::HashMap;
use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};

/// Base path for the cgroup v2 filesystem.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";

/// Facts about the host the engine runs on.
pub trait HostCapabilities: Send + Sync {
    /// Whether the engine runs without real root privileges.
    fn is_rootless(&self) -> bool;

    /// The invoking user's UID on the host.
    fn rootless_uid(&self) -> u32;

    fn rootless_gid(&self) -> u32;

    fn selinux_enabled(&self) -> bool;

    /// The cgroup this process lives in, relative to the cgroup root.
    fn own_cgroup(&self) -> PodliteResult<String>;

    /// Number of GIDs mapped into our user namespace.
    fn available_gids(&self) -> PodliteResult<u32>;

    /// A variable from the engine's own environment.
    fn inherited_env(&self, key: &str) -> Option<String>;

    fn hostname(&self) -> PodliteResult<String>;
}

/// Asks the running host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCapabilities;

impl HostCapabilities for SystemCapabilities {
    fn is_rootless(&self) -> bool {
        !nix::unistd::geteuid().is_root()
    }

    fn rootless_uid(&self) -> u32 {
        nix::unistd::getuid().as_raw()
    }

    fn rootless_gid(&self) -> u32 {
        nix::unistd::getgid().as_raw()
    }

    fn selinux_enabled(&self) -> bool {
        Path::new(SELINUX_ENFORCE).exists()
    }

    fn own_cgroup(&self) -> PodliteResult<String> {
        let content = std::fs::read_to_string("/proc/self/cgroup")
            .map_err(|e| PodliteError::from(e).context("reading /proc/self/cgroup"))?;
        parse_own_cgroup(&content)
    }

    fn available_gids(&self) -> PodliteResult<u32> {
        let content = std::fs::read_to_string("/proc/self/gid_map")
            .map_err(|e| PodliteError::from(e).context("reading /proc/self/gid_map"))?;
        parse_id_map_total(&content)
    }

    fn inherited_env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn hostname(&self) -> PodliteResult<String> {
        let name = nix::unistd::gethostname()
            .map_err(|e| PodliteError::Internal(format!("failed to get hostname: {}", e)))?;
        Ok(name.to_string_lossy().into_owned())
    }
}

/// Fixed answers, for embedding in tests or on hosts that should not be queried.
#[derive(Debug, Clone)]
pub struct StaticCapabilities {
    pub rootless: bool,
    pub uid: u32,
    pub gid: u32,
    pub selinux: bool,
    pub own_cgroup: Option<String>,
    pub available_gids: Option<u32>,
    pub env: HashMap<String, String>,
    pub hostname: String,
}

impl Default for StaticCapabilities {
    fn default() -> Self {
        Self {
            rootless: false,
            uid: 0,
            gid: 0,
            selinux: false,
            own_cgroup: None,
            available_gids: None,
            env: HashMap::new(),
            hostname: "localhost".to_string(),
        }
    }
}

impl HostCapabilities for StaticCapabilities {
    fn is_rootless(&self) -> bool {
        self.rootless
    }

    fn rootless_uid(&self) -> u32 {
        self.uid
    }

    fn rootless_gid(&self) -> u32 {
        self.gid
    }

    fn selinux_enabled(&self) -> bool {
        self.selinux
    }

    fn own_cgroup(&self) -> PodliteResult<String> {
        self.own_cgroup
            .clone()
            .ok_or_else(|| PodliteError::NotFound("own cgroup".into()))
    }

    fn available_gids(&self) -> PodliteResult<u32> {
        self.available_gids
            .ok_or_else(|| PodliteError::NotFound("gid map".into()))
    }

    fn inherited_env(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn hostname(&self) -> PodliteResult<String> {
        Ok(self.hostname.clone())
    }
}

/// The unified-hierarchy entry of a `/proc/<pid>/cgroup` file.
fn parse_own_cgroup(content: &str) -> PodliteResult<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim().to_string())
        .ok_or_else(|| PodliteError::NotFound("cgroup v2 entry in /proc/self/cgroup".into()))
}

/// Sum of the range sizes in a `uid_map` / `gid_map` file.
fn parse_id_map_total(content: &str) -> PodliteResult<u32> {
    let mut total: u64 = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let size = line
            .split_whitespace()
            .nth(2)
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| PodliteError::Internal(format!("malformed id map line {:?}", line)))?;
        total += size;
    }
    Ok(total.min(u32::MAX as u64) as u32)
}

/// Operating system family the engine was built for.
///
/// Namespace and mount operations only exist on Linux; every other target
/// gets a stub that fails with [`PodliteError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Unsupported(&'static str),
}

impl Platform {
    pub const fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unsupported(std::env::consts::OS)
        }
    }

    /// Fail unless `op` can run on this platform.
    pub fn require_linux(self, op: &str) -> PodliteResult<()> {
        match self {
            Platform::Linux => Ok(()),
            Platform::Unsupported(os) => Err(PodliteError::Unsupported(format!(
                "{} is not supported on {}",
                op, os
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_cgroup_uses_unified_entry() {
        let content = "12:pids:/user.slice\n0::/user.slice/user-1000.slice/session-2.scope\n";
        assert_eq!(
            parse_own_cgroup(content).unwrap(),
            "/user.slice/user-1000.slice/session-2.scope"
        );
        assert!(parse_own_cgroup("1:name=systemd:/\n").unwrap_err().is_not_found());
    }

    #[test]
    fn id_map_total_sums_ranges() {
        let content = "         0       1000          1\n         1     100000      65536\n";
        assert_eq!(parse_id_map_total(content).unwrap(), 65537);
        assert!(parse_id_map_total("0 0\n").is_err());
    }

    #[test]
    fn unsupported_platform_errors() {
        let err = Platform::Unsupported("plan9").require_linux("setns").unwrap_err();
        assert!(matches!(err, PodliteError::Unsupported(_)));
        assert!(Platform::Linux.require_linux("setns").is_ok());
    }
}
