//! Run code inside a running container's mount namespace.
//!
//! Namespaces belong to threads. Joining one from a pooled thread would
//! leak the container's view into unrelated work, so every call gets its
//! own thread which exits once the closure returns. The result travels
//! back over a oneshot channel.

use std::fs::File;

use nix::sched::{CloneFlags, setns, unshare};
use podlite_shared::errors::{PodliteError, PodliteResult};
use tokio::sync::oneshot;

use crate::caps::Platform;
use crate::container::config::ContainerConfig;
use crate::container::state::ContainerState;

const WORKER_NAME: &str = "podlite-nsexec";

/// Run `f` with the container's view of the filesystem.
///
/// A container that is not running has no namespace to join; its mount
/// point is already what the container would see, so `f` runs in place.
pub fn run_in_container_namespace<T, F>(
    config: &ContainerConfig,
    state: &ContainerState,
    f: F,
) -> PodliteResult<T>
where
    T: Send,
    F: FnOnce() -> PodliteResult<T> + Send,
{
    if !state.status.is_running() {
        return f();
    }

    Platform::current().require_linux("joining a container mount namespace")?;
    let pid = state.pid.ok_or_else(|| {
        PodliteError::InvalidState(format!("container {} is running but has no PID", config.id))
    })?;
    let join_pid = !shares_host_pid_namespace(config);

    let (tx, rx) = oneshot::channel::<PodliteResult<T>>();
    std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn_scoped(scope, move || {
                let result = enter_namespaces(pid, join_pid).and_then(|()| f());
                let _ = tx.send(result);
            })
            .map_err(|e| {
                PodliteError::Namespace(format!("failed to spawn namespace worker: {}", e))
            })?;

        rx.blocking_recv().map_err(|_| {
            PodliteError::Namespace(format!(
                "namespace worker for container {} exited without a result",
                config.id
            ))
        })?
    })
}

/// Whether the container runs in the host PID namespace.
fn shares_host_pid_namespace(config: &ContainerConfig) -> bool {
    if config.namespaces.pid.is_some() {
        return false;
    }
    !config.spec.linux().as_ref().is_some_and(|linux| {
        linux.namespaces().as_ref().is_some_and(|nss| {
            nss.iter()
                .any(|ns| ns.typ() == oci_spec::runtime::LinuxNamespaceType::Pid)
        })
    })
}

fn open_ns(pid: i32, kind: &str) -> PodliteResult<File> {
    let path = format!("/proc/{}/ns/{}", pid, kind);
    File::open(&path)
        .map_err(|e| PodliteError::Namespace(format!("failed to open {}: {}", path, e)))
}

/// Detach from our own mount namespace, then join the target's.
fn enter_namespaces(pid: i32, join_pid: bool) -> PodliteResult<()> {
    let mnt_ns = open_ns(pid, "mnt")?;
    let pid_ns = if join_pid { Some(open_ns(pid, "pid")?) } else { None };

    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| {
        PodliteError::Namespace(format!("failed to create a new mount namespace: {}", e))
    })?;

    if let Some(ns) = pid_ns {
        setns(&ns, CloneFlags::CLONE_NEWPID).map_err(|e| {
            PodliteError::Namespace(format!("failed to join PID namespace of {}: {}", pid, e))
        })?;
    }
    setns(&mnt_ns, CloneFlags::CLONE_NEWNS).map_err(|e| {
        PodliteError::Namespace(format!("failed to join mount namespace of {}: {}", pid, e))
    })?;

    tracing::debug!(pid, join_pid, "joined container namespaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::state::ContainerStatus;
    use std::path::PathBuf;

    #[test]
    fn stopped_container_runs_in_place() {
        let config = ContainerConfig::new("stopped");
        let mut state = ContainerState::new(PathBuf::from("/run/x"));
        state.status = ContainerStatus::Exited;

        let caller = std::thread::current().id();
        let ran_on = run_in_container_namespace(&config, &state, || Ok(std::thread::current().id()))
            .unwrap();
        assert_eq!(ran_on, caller);
    }

    #[test]
    fn running_container_without_pid_fails_before_running() {
        let config = ContainerConfig::new("broken");
        let mut state = ContainerState::new(PathBuf::from("/run/x"));
        state.status = ContainerStatus::Running;

        let mut ran = false;
        let err = run_in_container_namespace(&config, &state, || {
            ran = true;
            Ok(())
        })
        .unwrap_err();
        assert!(!ran);
        assert!(matches!(err, PodliteError::InvalidState(_) | PodliteError::Unsupported(_)));
    }

    #[test]
    fn default_spec_has_private_pid_namespace() {
        let config = ContainerConfig::new("pid");
        assert!(!shares_host_pid_namespace(&config));
    }
}
