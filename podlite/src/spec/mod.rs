//! Runtime spec generation.
//!
//! [`generate`] turns a prepared container into the OCI runtime spec handed
//! to the OCI runtime. Generation runs as a fixed sequence of stages over a
//! copy of the stored base spec; a failing stage aborts generation and its
//! error names the stage. Nothing is persisted except the state fields the
//! stages record (cgroup path, hooks).

pub mod cgroup;
pub(crate) mod mounts;
pub(crate) mod namespaces;
pub mod user;

use std::path::{Path, PathBuf};

use oci_spec::runtime::{LinuxSeccomp, Mount, MountBuilder, Process, RootBuilder, Spec};
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::config::ContainerConfig;
use crate::container::resolve::{self, is_path_on_mount, is_path_on_volume};
use crate::container::state::ContainerState;
use crate::container::{Container, mountpoint_of};
use crate::fs::chown::change_host_path_ownership;
use crate::fs::{label, secure_join};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::rt_impl::RuntimeImpl;
use mounts::{
    bind_mount, create_overlay_content_dir, is_tmpfs, mounts_contain, overlay_mount,
    split_markers,
};
use user::ExecUser;

pub const MANAGER_ANNOTATION: &str = "io.container.manager";
pub const MANAGER_NAME: &str = "podlite";
pub const CREATED_ANNOTATION: &str = "io.podlite.annotations.created";
pub const STOP_SIGNAL_ANNOTATION: &str = "org.opencontainers.image.stopSignal";

const BIND_OPTIONS: [&str; 2] = ["bind", "rprivate"];
const READ_ONLY_OPTIONS: [&str; 4] = ["ro", "nosuid", "noexec", "nodev"];
const SHM_OPTIONS: [&str; 3] = ["nosuid", "noexec", "nodev"];

/// Socket activation variables passed through from the engine's environment.
const LISTEN_ENV: [&str; 3] = ["LISTEN_PID", "LISTEN_FDS", "LISTEN_FDNAMES"];

/// Symlink hops followed when checking a missing working directory.
const MAX_WORKDIR_SYMLINKS: usize = 40;

// ============================================================================
// PROCESS ENVIRONMENT
// ============================================================================

fn with_process<R>(spec: &mut Spec, f: impl FnOnce(&mut Process) -> R) -> R {
    let mut process = spec.process().clone().unwrap_or_default();
    let result = f(&mut process);
    spec.set_process(Some(process));
    result
}

/// Value of `key` in the process environment.
pub(crate) fn env_value(spec: &Spec, key: &str) -> Option<String> {
    let prefix = format!("{}=", key);
    spec.process()
        .as_ref()?
        .env()
        .as_ref()?
        .iter()
        .find_map(|e| e.strip_prefix(&prefix).map(str::to_string))
}

/// Set `key` in the process environment, replacing any previous value.
pub(crate) fn set_env(spec: &mut Spec, key: &str, value: &str) {
    let prefix = format!("{}=", key);
    with_process(spec, |process| {
        let mut env = process.env().clone().unwrap_or_default();
        env.retain(|e| !e.starts_with(&prefix));
        env.push(format!("{}{}", prefix, value));
        process.set_env(Some(env));
    });
}

pub(crate) fn add_env_if_missing(spec: &mut Spec, key: &str, value: &str) {
    if env_value(spec, key).is_none() {
        set_env(spec, key, value);
    }
}

fn stage<T>(name: &str, result: PodliteResult<T>) -> PodliteResult<T> {
    result.map_err(|e| e.context(name))
}

// ============================================================================
// GENERATION
// ============================================================================

/// Build the runtime spec for a prepared container.
pub(crate) fn generate(ctr: &Container, state: &mut ContainerState) -> PodliteResult<Spec> {
    let config = ctr.config();
    let rt = &*ctr.runtime;
    let caps = &*rt.collaborators.capabilities;
    let mountpoint = mountpoint_of(ctr.id(), state)?;
    let mut spec = config.spec.clone();

    let (passwd_file, group_file) = user_files(config, state, &mountpoint, &rt.options)?;
    let exec = stage(
        "resolving user",
        user::exec_user(&passwd_file, &group_file, &config.user),
    )?;
    stage("applying umask", apply_umask(&mut spec, config))?;
    stage("loading seccomp profile", apply_seccomp(&mut spec, config, &rt.options))?;
    let host_ids = stage(
        "mapping user to host",
        config.id_mappings.host_ids(exec.uid, exec.gid),
    )?;

    let mut mount_list = spec.mounts().clone().unwrap_or_default();
    stage(
        "adding named volumes",
        add_named_volumes(ctr, rt, state, &mut mount_list, host_ids),
    )?;
    stage(
        "processing mount options",
        process_mount_options(rt, config, state, &mut mount_list, &exec, host_ids),
    )?;
    stage("adding bind mounts", add_bind_mounts(config, state, &mut mount_list))?;
    stage(
        "adding overlay volumes",
        add_overlay_volumes(config, state, &mut mount_list, host_ids),
    )?;
    stage("adding image volumes", add_image_volumes(rt, config, &mut mount_list))?;
    stage("resolving working directory", resolve_work_dir(ctr, &mountpoint, host_ids))?;
    spec.set_root(Some(
        RootBuilder::default()
            .path(mountpoint.clone())
            .readonly(config.read_only)
            .build()?,
    ));

    if !exec.home.is_empty() {
        add_env_if_missing(&mut spec, "HOME", &exec.home);
    }

    stage(
        "setting process user",
        set_process_user(&mut spec, config, caps, &exec, &group_file),
    )?;

    stage(
        "configuring namespaces",
        namespaces::configure(&mut spec, config, state, &|dep| rt.containers.state(dep)),
    )?;
    stage(
        "configuring hostname",
        namespaces::configure_hostname(&mut spec, config, caps),
    )?;

    set_annotations(&mut spec, config);

    let cgroup_path = stage(
        "computing cgroup path",
        rt.options.cgroup_manager.container_path(config, caps),
    )?;
    let mut linux = spec.linux().clone().unwrap_or_default();
    linux.set_cgroups_path(cgroup_path.as_ref().map(PathBuf::from));
    state.cgroup_path = cgroup_path;

    mounts::sort_mounts(&mut mount_list);
    stage(
        "resolving tmpfs destinations",
        mounts::resolve_tmpfs_destinations(&mut mount_list, &mountpoint),
    )?;
    if let Some(propagation) = mounts::root_propagation(&mount_list) {
        linux.set_rootfs_propagation(Some(propagation.to_string()));
    }
    spec.set_linux(Some(linux));
    spec.set_mounts(Some(mount_list));

    state.extension_stage_hooks = stage(
        "running precreate hooks",
        rt.collaborators.hooks.precreate(&mut spec),
    )?;

    if !config.env_secrets.is_empty() {
        let secrets = rt.collaborators.secrets()?;
        for (var, name) in &config.env_secrets {
            let data = stage("resolving env secrets", secrets.lookup_secret_data(name))?;
            set_env(&mut spec, var, &String::from_utf8_lossy(&data));
        }
    }

    for key in LISTEN_ENV {
        if let Some(value) = caps.inherited_env(key) {
            // The payload is PID 1 in its own PID namespace.
            let value = if key == "LISTEN_PID" { "1".to_string() } else { value };
            set_env(&mut spec, key, &value);
        }
    }

    Ok(spec)
}

// ============================================================================
// STAGES
// ============================================================================

/// passwd and group files used to resolve the process user.
fn user_files(
    config: &ContainerConfig,
    state: &ContainerState,
    mountpoint: &Path,
    options: &RuntimeOptions,
) -> PodliteResult<(PathBuf, PathBuf)> {
    if config.is_host_user() {
        let passwd = options.host_passwd_file.clone();
        let group = passwd.with_file_name("group");
        return Ok((passwd, group));
    }

    let mut passwd = None;
    let mut group = None;
    for m in config.spec.mounts().as_deref().unwrap_or_default() {
        let Some(source) = m.source() else { continue };
        match mounts::destination(m).as_str() {
            "/etc/passwd" => passwd = Some(source.clone()),
            "/etc/group" => group = Some(source.clone()),
            "/etc" => {
                passwd.get_or_insert_with(|| source.join("passwd"));
                group.get_or_insert_with(|| source.join("group"));
            }
            _ => {}
        }
    }
    if let Some(path) = state.bind_mounts.get("/etc/passwd") {
        passwd = Some(PathBuf::from(path));
    }
    if let Some(path) = state.bind_mounts.get("/etc/group") {
        group = Some(PathBuf::from(path));
    }

    let passwd = match passwd {
        Some(p) => p,
        None => secure_join(mountpoint, "/etc/passwd")?,
    };
    let group = match group {
        Some(g) => g,
        None => secure_join(mountpoint, "/etc/group")?,
    };
    Ok((passwd, group))
}

fn apply_umask(spec: &mut Spec, config: &ContainerConfig) -> PodliteResult<()> {
    let Some(umask) = config.umask.as_deref().filter(|u| !u.is_empty()) else {
        return Ok(());
    };
    let value = u32::from_str_radix(umask, 8)
        .map_err(|e| PodliteError::InvalidArgument(format!("invalid umask {:?}: {}", umask, e)))?;
    with_process(spec, |process| {
        let mut user = process.user().clone();
        user.set_umask(Some(value));
        process.set_user(user);
    });
    Ok(())
}

fn apply_seccomp(spec: &mut Spec, config: &ContainerConfig, options: &RuntimeOptions) -> PodliteResult<()> {
    let mut linux = spec.linux().clone().unwrap_or_default();
    if config.privileged {
        linux.set_seccomp(None);
        spec.set_linux(Some(linux));
        return Ok(());
    }

    let profile = config
        .seccomp_profile_path
        .clone()
        .or_else(|| options.default_seccomp_profile.clone());
    match profile {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                PodliteError::Config(format!("reading seccomp profile {}: {}", path.display(), e))
            })?;
            let seccomp: LinuxSeccomp = serde_json::from_str(&raw).map_err(|e| {
                PodliteError::Config(format!("parsing seccomp profile {}: {}", path.display(), e))
            })?;
            linux.set_seccomp(Some(seccomp));
            spec.set_linux(Some(linux));
        }
        None if options.seccomp_profile_required && linux.seccomp().is_none() => {
            return Err(PodliteError::Config(
                "a seccomp profile is required but none is configured".into(),
            ));
        }
        None => {}
    }
    Ok(())
}

fn relabel_source(rt: &RuntimeImpl, config: &ContainerConfig, path: &Path, shared: bool) -> PodliteResult<()> {
    match &config.mount_label {
        Some(mount_label) if rt.collaborators.capabilities.selinux_enabled() => {
            label::relabel(path, mount_label, shared)
        }
        _ => Ok(()),
    }
}

fn add_named_volumes(
    ctr: &Container,
    rt: &RuntimeImpl,
    state: &ContainerState,
    mount_list: &mut Vec<Mount>,
    (uid, gid): (u32, u32),
) -> PodliteResult<()> {
    let config = ctr.config();
    for volume in &config.named_volumes {
        let mount_point = ctr
            .volume_mount_point(&volume.name)
            .map_err(|e| e.context(format!("retrieving volume {}", volume.name)))?
            .ok_or_else(|| PodliteError::VolumeNotMounted(volume.name.clone()))?;
        let source = match volume.sub_path.as_deref().filter(|s| !s.is_empty()) {
            Some(sub_path) => secure_join(&mount_point, sub_path)?,
            None => mount_point,
        };

        let (options, markers) = split_markers(&volume.options);
        // Ownership is fixed once; later starts keep whatever the payload did.
        let chown = markers.chown && state.status.is_initial();
        if let Some(shared) = markers.relabel {
            relabel_source(rt, config, &source, shared)?;
        }

        if markers.overlay {
            let content_dir = create_overlay_content_dir(&config.static_dir)?;
            if chown {
                change_host_path_ownership(&source, true, uid, gid)?;
                change_host_path_ownership(&content_dir, true, uid, gid)?;
            }
            mount_list.push(overlay_mount(&source, &volume.dest, &content_dir, &options)?);
        } else {
            if chown {
                change_host_path_ownership(&source, true, uid, gid)?;
            }
            mount_list.push(bind_mount(&source, &volume.dest, options)?);
        }
    }
    Ok(())
}

/// Handle `z`, `Z` and `U` on every mount collected so far.
fn process_mount_options(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    state: &ContainerState,
    mount_list: &mut [Mount],
    exec: &ExecUser,
    (uid, gid): (u32, u32),
) -> PodliteResult<()> {
    for m in mount_list.iter_mut() {
        let Some(original) = m.options().clone() else { continue };
        let (mut options, markers) = split_markers(&original);
        if let Some(shared) = markers.relabel
            && let Some(source) = m.source()
        {
            relabel_source(rt, config, source, shared)?;
        }
        if markers.chown {
            if is_tmpfs(m) {
                options.push(format!("uid={}", exec.uid));
                options.push(format!("gid={}", exec.gid));
            } else if state.status.is_initial()
                && let Some(source) = m.source()
            {
                change_host_path_ownership(source, true, uid, gid)?;
            }
        }
        m.set_options(Some(options));
    }
    Ok(())
}

fn add_bind_mounts(
    config: &ContainerConfig,
    state: &ContainerState,
    mount_list: &mut Vec<Mount>,
) -> PodliteResult<()> {
    for (dest, source) in &state.bind_mounts {
        if mounts_contain(mount_list, dest) {
            tracing::info!(container_id = %config.id, destination = %dest, "user mount overriding generated mount");
            continue;
        }
        let mut options: Vec<String> = BIND_OPTIONS.iter().map(|o| o.to_string()).collect();
        if dest == "/dev/shm" {
            if config.shm_dir.as_deref() == Some(Path::new(source)) {
                options.extend(SHM_OPTIONS.iter().map(|o| o.to_string()));
            }
        } else if config.read_only {
            options.extend(READ_ONLY_OPTIONS.iter().map(|o| o.to_string()));
        }
        mount_list.push(
            MountBuilder::default()
                .destination(dest.as_str())
                .typ("bind")
                .source(source.as_str())
                .options(options)
                .build()?,
        );
    }
    Ok(())
}

fn add_overlay_volumes(
    config: &ContainerConfig,
    state: &ContainerState,
    mount_list: &mut Vec<Mount>,
    (uid, gid): (u32, u32),
) -> PodliteResult<()> {
    for volume in &config.overlay_volumes {
        let (options, markers) = split_markers(&volume.options);
        let content_dir = create_overlay_content_dir(&config.static_dir)?;
        if markers.chown && state.status.is_initial() {
            change_host_path_ownership(&volume.source, true, uid, gid)?;
            change_host_path_ownership(&content_dir, true, uid, gid)?;
        }
        mount_list.push(overlay_mount(&volume.source, &volume.dest, &content_dir, &options)?);
    }
    Ok(())
}

fn add_image_volumes(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    mount_list: &mut Vec<Mount>,
) -> PodliteResult<()> {
    if config.image_volumes.is_empty() {
        return Ok(());
    }
    let images = rt.collaborators.images()?;
    for volume in &config.image_volumes {
        let mount_point = images.mount_image(&volume.source).map_err(|e| {
            e.context(format!("mounting image volume {}:{}", volume.source, volume.dest))
        })?;
        if volume.read_write {
            let content_dir = create_overlay_content_dir(&config.static_dir)?;
            mount_list.push(overlay_mount(&mount_point, &volume.dest, &content_dir, &[])?);
        } else {
            mount_list.push(bind_mount(&mount_point, &volume.dest, vec!["rbind".into(), "ro".into()])?);
        }
    }
    Ok(())
}

/// Make sure the working directory exists in the rootfs.
fn resolve_work_dir(ctr: &Container, mountpoint: &Path, (uid, gid): (u32, u32)) -> PodliteResult<()> {
    let config = ctr.config();
    let workdir = config.work_dir();
    if is_path_on_volume(config, &workdir) || is_path_on_mount(config, &workdir) {
        tracing::debug!(container_id = %config.id, workdir = %workdir, "workdir is on a volume or mount");
        return Ok(());
    }

    let volume_mount_point = |name: &str| ctr.volume_mount_point(name);
    let (_, host_path) = resolve::resolve_path(config, mountpoint, &workdir, &volume_mount_point)?;
    match std::fs::metadata(&host_path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(PodliteError::InvalidArgument(format!(
            "workdir {:?} exists on container {}, but is not a directory",
            workdir, config.id
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if !config.create_working_dir {
                if work_dir_symlink_resolves(config, mountpoint, &workdir) {
                    return Ok(());
                }
                return Err(PodliteError::InvalidArgument(format!(
                    "workdir {:?} does not exist on container {}",
                    workdir, config.id
                )));
            }
            std::fs::create_dir_all(&host_path).map_err(|e| {
                PodliteError::from(e).context(format!("creating container {} workdir", config.id))
            })?;
            crate::fs::chown::chown_path(&host_path, uid, gid)
        }
        Err(e) => Err(PodliteError::from(e)
            .context(format!("detecting workdir {:?} on container {}", workdir, config.id))),
    }
}

/// Whether `workdir` is a symlink chain ending on a volume, a mount, or an
/// existing path in the rootfs.
fn work_dir_symlink_resolves(config: &ContainerConfig, mountpoint: &Path, workdir: &str) -> bool {
    let mut current = workdir.to_string();
    for _ in 0..MAX_WORKDIR_SYMLINKS {
        let raw = mountpoint.join(current.trim_start_matches('/'));
        let Ok(target) = std::fs::read_link(&raw) else {
            return false;
        };
        let target = target.to_string_lossy();
        let next = if target.starts_with('/') {
            crate::util::clean_path(&target)
        } else {
            let parent = Path::new(&current).parent().unwrap_or(Path::new("/"));
            crate::util::clean_path(&format!("{}/{}", parent.display(), target))
        };
        if is_path_on_volume(config, &next) || is_path_on_mount(config, &next) {
            return true;
        }
        if secure_join(mountpoint, &next).is_ok_and(|p| p.exists()) {
            tracing::debug!(workdir = %workdir, target = %next, "workdir is a symlink to an existing path");
            return true;
        }
        current = next;
    }
    false
}

fn set_process_user(
    spec: &mut Spec,
    config: &ContainerConfig,
    caps: &dyn crate::caps::HostCapabilities,
    exec: &ExecUser,
    group_file: &Path,
) -> PodliteResult<()> {
    let mut additional: Vec<u32> = Vec::new();
    let mut add = |gid: u32| {
        if !additional.contains(&gid) {
            additional.push(gid);
        }
    };

    if !config.user.is_empty() {
        add(exec.gid);
    }
    if !config.groups.is_empty() {
        for gid in user::group_ids(group_file, &config.groups)? {
            add(gid);
        }
    }

    // Supplementary groups of the user only apply when no group was named.
    if !config.user.contains(':') {
        let gid_map = &config.id_mappings.gid_map;
        let available = if gid_map.is_empty() && caps.is_rootless() {
            Some(caps.available_gids().map_err(|e| e.context("reading available GIDs"))?)
        } else {
            None
        };
        for &gid in &exec.sgids {
            let mapped = if !gid_map.is_empty() {
                gid_map
                    .iter()
                    .any(|m| gid >= m.container_id && gid - m.container_id < m.size)
            } else {
                available.is_none_or(|n| gid < n)
            };
            if mapped {
                add(gid);
            } else {
                tracing::warn!(container_id = %config.id, gid, "additional gid is not present in the user namespace, skipping");
            }
        }
    }

    with_process(spec, |process| {
        let mut user = process.user().clone();
        if !config.user.is_empty() {
            user.set_uid(exec.uid);
            user.set_gid(exec.gid);
        }
        if !additional.is_empty() {
            let mut gids = user.additional_gids().clone().unwrap_or_default();
            for gid in additional {
                if !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
            user.set_additional_gids(Some(gids));
        }
        process.set_user(user);
    });
    Ok(())
}

fn set_annotations(spec: &mut Spec, config: &ContainerConfig) {
    let mut annotations = spec.annotations().clone().unwrap_or_default();
    annotations.insert(STOP_SIGNAL_ANNOTATION.to_string(), config.stop_signal.to_string());
    annotations
        .entry(MANAGER_ANNOTATION.to_string())
        .or_insert_with(|| MANAGER_NAME.to_string());
    annotations.insert(CREATED_ANNOTATION.to_string(), config.created_at.to_rfc3339());
    spec.set_annotations(Some(annotations));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::StaticCapabilities;
    use crate::container::config::{IdMap, IdMappings};
    use mounts::mount_options;

    #[test]
    fn env_helpers() {
        let mut spec = Spec::default();
        set_env(&mut spec, "A", "1");
        set_env(&mut spec, "A", "2");
        add_env_if_missing(&mut spec, "A", "3");
        assert_eq!(env_value(&spec, "A").as_deref(), Some("2"));
        let count = spec
            .process()
            .as_ref()
            .unwrap()
            .env()
            .as_ref()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("A="))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn umask_is_octal() {
        let mut spec = Spec::default();
        let mut config = ContainerConfig::new("c");
        config.umask = Some("0027".into());
        apply_umask(&mut spec, &config).unwrap();
        assert_eq!(spec.process().as_ref().unwrap().user().umask(), Some(0o027));

        config.umask = Some("999".into());
        assert!(matches!(
            apply_umask(&mut spec, &config),
            Err(PodliteError::InvalidArgument(_))
        ));
    }

    #[test]
    fn seccomp_required_without_profile() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = RuntimeOptions::with_home(dir.path());
        options.seccomp_profile_required = true;
        let mut config = ContainerConfig::new("c");
        let mut spec = Spec::default();
        assert!(matches!(
            apply_seccomp(&mut spec, &config, &options),
            Err(PodliteError::Config(_))
        ));

        let profile = dir.path().join("seccomp.json");
        std::fs::write(&profile, r#"{"defaultAction": "SCMP_ACT_ERRNO"}"#).unwrap();
        options.default_seccomp_profile = Some(profile);
        apply_seccomp(&mut spec, &config, &options).unwrap();
        assert!(spec.linux().as_ref().unwrap().seccomp().is_some());

        config.privileged = true;
        apply_seccomp(&mut spec, &config, &options).unwrap();
        assert!(spec.linux().as_ref().unwrap().seccomp().is_none());
    }

    #[test]
    fn unmapped_supplementary_groups_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ContainerConfig::new("c");
        config.user = "app".into();
        config.id_mappings = IdMappings {
            uid_map: vec![],
            gid_map: vec![IdMap { container_id: 0, host_id: 100000, size: 100 }],
        };
        let exec = ExecUser { uid: 1000, gid: 10, home: "/home/app".into(), sgids: vec![20, 5000] };
        let mut spec = Spec::default();
        let caps = StaticCapabilities::default();
        set_process_user(&mut spec, &config, &caps, &exec, &dir.path().join("group")).unwrap();

        let user = spec.process().as_ref().unwrap().user().clone();
        assert_eq!((user.uid(), user.gid()), (1000, 10));
        assert_eq!(user.additional_gids().clone().unwrap(), vec![10, 20]);
    }

    #[test]
    fn rootless_groups_limited_by_available_gids() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContainerConfig::new("c");
        let exec = ExecUser { sgids: vec![3, 70000], ..Default::default() };
        let caps = StaticCapabilities {
            rootless: true,
            available_gids: Some(65536),
            ..Default::default()
        };
        let mut spec = Spec::default();
        set_process_user(&mut spec, &config, &caps, &exec, &dir.path().join("group")).unwrap();
        let user = spec.process().as_ref().unwrap().user().clone();
        assert_eq!(user.additional_gids().clone().unwrap(), vec![3]);
    }

    #[test]
    fn bind_map_becomes_mounts() {
        let mut config = ContainerConfig::new("c");
        config.read_only = true;
        config.shm_dir = Some(PathBuf::from("/run/shm/c"));
        let mut state = ContainerState::default();
        state.bind_mounts.insert("/etc/hosts".into(), "/run/c/hosts".into());
        state.bind_mounts.insert("/dev/shm".into(), "/run/shm/c".into());
        state.bind_mounts.insert("/etc/resolv.conf".into(), "/run/c/resolv.conf".into());

        let mut mount_list = vec![bind_mount(Path::new("/mine"), "/etc/resolv.conf", vec![]).unwrap()];
        add_bind_mounts(&config, &state, &mut mount_list).unwrap();

        assert_eq!(mount_list.len(), 3);
        let resolv: Vec<_> = mount_list
            .iter()
            .filter(|m| mounts::destination(m) == "/etc/resolv.conf")
            .collect();
        assert_eq!(resolv.len(), 1);
        assert_eq!(resolv[0].source().as_deref(), Some(Path::new("/mine")));

        let hosts = mount_list.iter().find(|m| mounts::destination(m) == "/etc/hosts").unwrap();
        assert_eq!(mount_options(hosts), vec!["bind", "rprivate", "ro", "nosuid", "noexec", "nodev"]);
        let shm = mount_list.iter().find(|m| mounts::destination(m) == "/dev/shm").unwrap();
        assert_eq!(mount_options(shm), vec!["bind", "rprivate", "nosuid", "noexec", "nodev"]);
    }

    #[test]
    fn annotations_keep_existing_manager() {
        let config = ContainerConfig::new("c");
        let mut spec = Spec::default();
        set_annotations(&mut spec, &config);
        let annotations = spec.annotations().clone().unwrap();
        assert_eq!(annotations[MANAGER_ANNOTATION], MANAGER_NAME);
        assert_eq!(annotations[STOP_SIGNAL_ANNOTATION], "15");

        let mut custom = std::collections::HashMap::new();
        custom.insert(MANAGER_ANNOTATION.to_string(), "other".to_string());
        spec.set_annotations(Some(custom));
        set_annotations(&mut spec, &config);
        assert_eq!(spec.annotations().as_ref().unwrap()[MANAGER_ANNOTATION], "other");
    }

    #[test]
    fn workdir_symlink_to_volume() {
        let rootfs = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/data/app", rootfs.path().join("app")).unwrap();
        let mut config = ContainerConfig::new("c");
        config.named_volumes.push(crate::container::config::NamedVolume {
            name: "data".into(),
            dest: "/data".into(),
            options: vec![],
            sub_path: None,
        });
        assert!(work_dir_symlink_resolves(&config, rootfs.path(), "/app"));
        assert!(!work_dir_symlink_resolves(&config, rootfs.path(), "/missing"));
    }
}
