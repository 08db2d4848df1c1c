//! Files the engine generates and bind-mounts into a container.
//!
//! Everything produced here ends up in the state's bind-mount map, keyed by
//! the destination inside the container. The spec generator turns that map
//! into mounts.

mod hosts;
mod passwd;
mod resolvconf;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

use super::config::ContainerConfig;
use super::state::ContainerState;
use super::{Container, mountpoint_of};
use crate::fs::{copy_file, copy_tree, label};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::rt_impl::RuntimeImpl;
use crate::runtime::types::ContainerID;
use crate::spec::mounts::mount_exists;
use crate::util::{clean_path, remove_file_if_exists, write_file_mode};

use passwd::{UserFiles, generate_passwd_and_group};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const HOSTS: &str = "/etc/hosts";
const HOSTNAME: &str = "/etc/hostname";
const LOCALTIME: &str = "/etc/localtime";
const CONTAINERENV: &str = "/run/.containerenv";
const SECRETS_DIR: &str = "/run/secrets";
const SHM: &str = "/dev/shm";

/// Record `src` at `dest`, and at the same path under every chroot directory.
pub(crate) fn mount_into_root_dirs(
    config: &ContainerConfig,
    bind_mounts: &mut BTreeMap<String, String>,
    dest: &str,
    src: &Path,
) {
    let src = src.to_string_lossy().into_owned();
    for chroot in &config.chroot_dirs {
        bind_mounts.insert(clean_path(&format!("{}/{}", chroot, dest)), src.clone());
    }
    bind_mounts.insert(dest.to_string(), src);
}

fn forget_root_dirs(config: &ContainerConfig, bind_mounts: &mut BTreeMap<String, String>, dest: &str) {
    for chroot in &config.chroot_dirs {
        bind_mounts.remove(&clean_path(&format!("{}/{}", chroot, dest)));
    }
    bind_mounts.remove(dest);
}

/// Populate the bind-mount map of a prepared container.
pub(crate) fn make_bind_mounts(ctr: &Container, state: &mut ContainerState) -> PodliteResult<()> {
    let config = ctr.config();
    let rt = &*ctr.runtime;
    let mountpoint = mountpoint_of(ctr.id(), state)?;

    std::fs::create_dir_all(&state.run_dir).map_err(|e| {
        PodliteError::from(e).context(format!("creating run directory {}", state.run_dir.display()))
    })?;
    std::fs::create_dir_all(&config.static_dir).map_err(|e| {
        PodliteError::from(e).context(format!("creating static directory {}", config.static_dir.display()))
    })?;

    match &config.namespaces.net {
        Some(dep) => share_network_files(rt, config, state, dep)?,
        None => generate_network_files(rt, config, state, &mountpoint)?,
    }

    if !mount_exists(&config.spec, SHM)
        && let Some(shm) = &config.shm_dir
    {
        state.bind_mounts.insert(SHM.to_string(), shm.to_string_lossy().into_owned());
    }

    let files = UserFiles {
        config,
        mountpoint: &mountpoint,
        host_passwd: &rt.options.host_passwd_file,
        caps: &*rt.collaborators.capabilities,
    };
    let generated = generate_passwd_and_group(&files, &config.static_dir)?;
    if let Some(path) = generated.passwd {
        relabel_generated(rt, config, &path, false)?;
        state.bind_mounts.insert("/etc/passwd".into(), path.to_string_lossy().into_owned());
    }
    if let Some(path) = generated.group {
        relabel_generated(rt, config, &path, false)?;
        state.bind_mounts.insert("/etc/group".into(), path.to_string_lossy().into_owned());
    }

    if !state.bind_mounts.contains_key(HOSTNAME) && !mount_exists(&config.spec, HOSTNAME) {
        let content = format!("{}\n", config.hostname());
        let path = write_file_mode(&state.run_dir, "hostname", content.as_bytes(), 0o644)?;
        relabel_generated(rt, config, &path, false)?;
        mount_into_root_dirs(config, &mut state.bind_mounts, HOSTNAME, &path);
    }

    if !state.bind_mounts.contains_key(CONTAINERENV) && !mount_exists(&config.spec, CONTAINERENV) {
        let content = containerenv(config, rt.collaborators.capabilities.is_rootless());
        let path = write_file_mode(&state.run_dir, ".containerenv", content.as_bytes(), 0o644)?;
        relabel_generated(rt, config, &path, false)?;
        mount_into_root_dirs(config, &mut state.bind_mounts, CONTAINERENV, &path);
    }

    if let Some(tz) = config.timezone.as_deref().filter(|tz| !tz.is_empty())
        && !state.bind_mounts.contains_key(LOCALTIME)
    {
        let source = localtime_source(tz, &rt.options)?;
        let path = state.run_dir.join("localtime");
        if !path.exists() {
            copy_file(&source, &path)?;
        }
        relabel_generated(rt, config, &path, false)?;
        state.bind_mounts.insert(LOCALTIME.into(), path.to_string_lossy().into_owned());
    }

    if let Some(file) = &rt.options.default_mounts_file {
        mount_subscriptions(config, state, file)?;
    }

    if !config.secrets.is_empty() {
        mount_secrets(rt, config, state)?;
    }

    Ok(())
}

fn relabel_generated(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    path: &Path,
    shared: bool,
) -> PodliteResult<()> {
    match &config.mount_label {
        Some(mount_label) if rt.collaborators.capabilities.selinux_enabled() => {
            label::relabel(path, mount_label, shared)
        }
        _ => Ok(()),
    }
}

// ============================================================================
// NETWORK FILES
// ============================================================================

/// Follow network namespace references to the container that owns the namespace.
fn network_owner(
    rt: &RuntimeImpl,
    first: &ContainerID,
) -> PodliteResult<(ContainerConfig, ContainerState)> {
    let mut seen = Vec::new();
    let mut id = first.clone();
    loop {
        if seen.contains(&id) {
            return Err(PodliteError::InvalidState(format!(
                "network namespace dependency cycle at container {}",
                id
            )));
        }
        seen.push(id.clone());
        let (config, state) = rt.containers.get(&id)?;
        match &config.namespaces.net {
            Some(next) => id = next.clone(),
            None => return Ok((config, state)),
        }
    }
}

fn share_network_files(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    state: &mut ContainerState,
    dep: &ContainerID,
) -> PodliteResult<()> {
    let (owner, owner_state) = network_owner(rt, dep)?;

    if !config.use_image_resolv_conf {
        match owner_state.bind_mounts.get(RESOLV_CONF) {
            Some(path) => {
                mount_into_root_dirs(config, &mut state.bind_mounts, RESOLV_CONF, Path::new(path))
            }
            None => tracing::debug!(
                container_id = %config.id,
                owner = %owner.id,
                "network owner has no resolv.conf, not sharing"
            ),
        }
    }

    if !config.use_image_hosts
        && let Some(path) = owner_state.bind_mounts.get(HOSTS)
    {
        let path = PathBuf::from(path);
        hosts::add_entry(&path, &hosts::localhost_entry(config))?;
        mount_into_root_dirs(config, &mut state.bind_mounts, HOSTS, &path);
    }
    Ok(())
}

fn generate_network_files(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    state: &mut ContainerState,
    mountpoint: &Path,
) -> PodliteResult<()> {
    if !config.use_image_resolv_conf {
        remove_file_if_exists(&state.run_dir.join("resolv.conf"))?;
        forget_root_dirs(config, &mut state.bind_mounts, RESOLV_CONF);
        let content = resolvconf::generate(config, &rt.options, &state.network_status)?;
        let path = write_file_mode(&state.run_dir, "resolv.conf", content.as_bytes(), 0o644)?;
        relabel_generated(rt, config, &path, true)?;
        mount_into_root_dirs(config, &mut state.bind_mounts, RESOLV_CONF, &path);
    }

    if !config.use_image_hosts {
        remove_file_if_exists(&state.run_dir.join("hosts"))?;
        forget_root_dirs(config, &mut state.bind_mounts, HOSTS);
        let content = hosts::generate(
            config,
            &rt.options.base_hosts_file,
            mountpoint,
            &state.network_status,
        )?;
        let path = write_file_mode(&state.run_dir, "hosts", content.as_bytes(), 0o644)?;
        relabel_generated(rt, config, &path, true)?;
        mount_into_root_dirs(config, &mut state.bind_mounts, HOSTS, &path);
    }
    Ok(())
}

// ============================================================================
// MISC FILES
// ============================================================================

/// `/run/.containerenv`. Only privileged containers learn about their engine.
fn containerenv(config: &ContainerConfig, rootless: bool) -> String {
    if !config.privileged {
        return String::new();
    }
    format!(
        "engine=\"podlite-{}\"\nname=\"{}\"\nid=\"{}\"\nimage=\"{}\"\nimageid=\"{}\"\nrootless={}\n",
        env!("CARGO_PKG_VERSION"),
        config.name,
        config.id,
        config.image_name.as_deref().unwrap_or_default(),
        config.image_id.as_deref().unwrap_or_default(),
        u8::from(rootless)
    )
}

/// Host file providing the zone `tz`. `local` means the host's own zone.
fn localtime_source(tz: &str, options: &RuntimeOptions) -> PodliteResult<PathBuf> {
    if tz == "local" {
        return std::fs::canonicalize(&options.host_localtime).map_err(|e| {
            PodliteError::from(e).context(format!(
                "resolving host timezone {}",
                options.host_localtime.display()
            ))
        });
    }
    let relative = Path::new(tz);
    if relative.is_absolute() || relative.components().any(|c| c == Component::ParentDir) {
        return Err(PodliteError::InvalidArgument(format!("invalid timezone {:?}", tz)));
    }
    let path = options.zoneinfo_dir.join(relative);
    if !path.is_file() {
        return Err(PodliteError::InvalidArgument(format!(
            "finding timezone {}: {} does not exist",
            tz,
            path.display()
        )));
    }
    Ok(path)
}

/// `src:dst` pairs from a subscriptions file. Blank lines and comments are skipped.
fn parse_subscriptions(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| match line.split_once(':') {
            Some((src, dst)) => (src.to_string(), dst.to_string()),
            None => (line.to_string(), line.to_string()),
        })
        .collect()
}

fn mount_subscriptions(
    config: &ContainerConfig,
    state: &mut ContainerState,
    file: &Path,
) -> PodliteResult<()> {
    let content = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PodliteError::from(e).context(format!("reading {}", file.display()))),
    };
    let root = state.run_dir.join("subscriptions");
    for (src, dst) in parse_subscriptions(&content) {
        let dst = clean_path(&format!("/{}", dst));
        if state.bind_mounts.contains_key(&dst) || mount_exists(&config.spec, &dst) {
            continue;
        }
        let src = Path::new(&src);
        if !src.exists() {
            tracing::debug!(source = %src.display(), "subscription source missing, skipping");
            continue;
        }
        let target = root.join(dst.trim_start_matches('/'));
        if !target.exists() {
            copy_tree(src, &target)?;
        }
        state.bind_mounts.insert(dst, target.to_string_lossy().into_owned());
    }
    Ok(())
}

fn secret_destination(name: &str, target: Option<&str>) -> String {
    match target.filter(|t| !t.is_empty()) {
        Some(t) if t.starts_with('/') => clean_path(t),
        Some(t) => clean_path(&format!("{}/{}", SECRETS_DIR, t)),
        None => format!("{}/{}", SECRETS_DIR, name),
    }
}

fn mount_secrets(
    rt: &RuntimeImpl,
    config: &ContainerConfig,
    state: &mut ContainerState,
) -> PodliteResult<()> {
    let dir = if config.secrets_path.as_os_str().is_empty() {
        config.static_dir.join("secrets")
    } else {
        config.secrets_path.clone()
    };
    std::fs::create_dir_all(&dir)
        .map_err(|e| PodliteError::from(e).context(format!("creating {}", dir.display())))?;

    for secret in &config.secrets {
        let path = dir.join(&secret.name);
        if !path.exists() {
            let data = rt.collaborators.secrets()?.lookup_secret_data(&secret.name)?;
            write_file_mode(&dir, &secret.name, &data, 0o400)?;
        }
        let dest = secret_destination(&secret.name, secret.target.as_deref());
        state.bind_mounts.insert(dest, path.to_string_lossy().into_owned());
    }
    relabel_generated(rt, config, &dir, false)?;

    if !state.bind_mounts.contains_key(SECRETS_DIR) {
        state
            .bind_mounts
            .insert(SECRETS_DIR.into(), dir.to_string_lossy().into_owned());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroot_dirs_mirror_entries() {
        let mut config = ContainerConfig::new("c");
        config.chroot_dirs = vec!["/chroot".into()];
        let mut map = BTreeMap::new();
        mount_into_root_dirs(&config, &mut map, "/etc/hosts", Path::new("/run/x/hosts"));
        assert_eq!(map.get("/etc/hosts").unwrap(), "/run/x/hosts");
        assert_eq!(map.get("/chroot/etc/hosts").unwrap(), "/run/x/hosts");

        forget_root_dirs(&config, &mut map, "/etc/hosts");
        assert!(map.is_empty());
    }

    #[test]
    fn containerenv_only_for_privileged() {
        let mut config = ContainerConfig::new("web");
        assert_eq!(containerenv(&config, false), "");
        config.privileged = true;
        config.image_name = Some("docker.io/library/alpine:latest".into());
        let content = containerenv(&config, true);
        assert!(content.starts_with("engine=\"podlite-"));
        assert!(content.contains("name=\"web\"\n"));
        assert!(content.contains("image=\"docker.io/library/alpine:latest\"\n"));
        assert!(content.ends_with("rootless=1\n"));
    }

    #[test]
    fn timezone_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = RuntimeOptions::with_home(dir.path());
        options.zoneinfo_dir = dir.path().join("zoneinfo");
        std::fs::create_dir_all(options.zoneinfo_dir.join("Europe")).unwrap();
        std::fs::write(options.zoneinfo_dir.join("Europe/Paris"), "TZif").unwrap();
        options.host_localtime = options.zoneinfo_dir.join("Europe/Paris");

        assert_eq!(
            localtime_source("Europe/Paris", &options).unwrap(),
            options.zoneinfo_dir.join("Europe/Paris")
        );
        assert!(localtime_source("../../etc/shadow", &options).is_err());
        assert!(localtime_source("Mars/Olympus", &options).is_err());
        assert!(localtime_source("local", &options).unwrap().ends_with("Europe/Paris"));
    }

    #[test]
    fn subscription_lines() {
        let parsed = parse_subscriptions("# c\n/usr/share/rhel/secrets:/run/secrets\n\n/etc/pki\n");
        assert_eq!(
            parsed,
            vec![
                ("/usr/share/rhel/secrets".to_string(), "/run/secrets".to_string()),
                ("/etc/pki".to_string(), "/etc/pki".to_string()),
            ]
        );
    }

    #[test]
    fn secret_targets() {
        assert_eq!(secret_destination("db", None), "/run/secrets/db");
        assert_eq!(secret_destination("db", Some("pw")), "/run/secrets/pw");
        assert_eq!(secret_destination("db", Some("/etc/db/pw")), "/etc/db/pw");
    }
}
