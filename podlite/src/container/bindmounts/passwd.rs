//! Synthesized `/etc/passwd` and `/etc/group` entries.
//!
//! A container running as a UID the image does not know about still needs a
//! passwd entry for tools that look up the current user. Entries are added
//! for the configured user, the invoking rootless user, and host users.

use std::io::Write;
use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::caps::HostCapabilities;
use crate::container::config::ContainerConfig;
use crate::fs::secure_join;
use crate::spec::mounts::mount_exists;
use crate::spec::user::{self, GroupEntry, PasswdEntry};

const DEFAULT_PASSWD_TEMPLATE: &str = "$USERNAME:*:$UID:$GID:$NAME:$HOME:/bin/sh\n";

/// Everything needed to decide which entries to add.
pub(crate) struct UserFiles<'a> {
    pub config: &'a ContainerConfig,
    /// Mounted image root.
    pub mountpoint: &'a Path,
    pub host_passwd: &'a Path,
    pub caps: &'a dyn HostCapabilities,
}

/// Paths of generated files to bind over the image's own.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct GeneratedUserFiles {
    pub passwd: Option<PathBuf>,
    pub group: Option<PathBuf>,
}

impl UserFiles<'_> {
    fn image_passwd(&self) -> PodliteResult<PathBuf> {
        secure_join(self.mountpoint, "/etc/passwd")
    }

    fn image_group(&self) -> PodliteResult<PathBuf> {
        secure_join(self.mountpoint, "/etc/group")
    }

    fn host_group(&self) -> PathBuf {
        self.host_passwd.with_file_name("group")
    }

    fn wants_entries(&self) -> bool {
        if self.config.passwd == Some(false) {
            return false;
        }
        self.config.add_current_user_passwd_entry
            || !self.config.user.is_empty()
            || !self.config.host_users.is_empty()
    }

    fn adds_current_user(&self) -> bool {
        self.config.add_current_user_passwd_entry
            && self.caps.is_rootless()
            && self.caps.rootless_uid() != 0
    }

    fn user_parts(&self) -> (&str, Option<&str>) {
        match self.config.user.split_once(':') {
            Some((u, g)) => (u, Some(g)),
            None => (self.config.user.as_str(), None),
        }
    }

    /// Whether a declared mount or named volume lands exactly on `home`.
    fn home_is_mounted(&self, home: &str) -> bool {
        mount_exists(&self.config.spec, home)
            || self.config.named_volumes.iter().any(|v| v.dest == home)
    }

    fn passwd_line(&self, username: &str, uid: u32, gid: u32, name: &str, home: &str) -> String {
        let template = self
            .config
            .passwd_entry
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_PASSWD_TEMPLATE);
        let mut line = template
            .replace("$USERNAME", username)
            .replace("$UID", &uid.to_string())
            .replace("$GID", &gid.to_string())
            .replace("$NAME", name)
            .replace("$HOME", home);
        if !line.ends_with('\n') {
            line.push('\n');
        }
        line
    }

    fn image_has_user(&self, entries: &[PasswdEntry], name: &str, uid: u32) -> bool {
        entries.iter().any(|e| e.name == name || e.uid == uid)
    }

    /// Entry for the invoking user of a rootless engine.
    fn current_user_entry(&self, image: &[PasswdEntry]) -> PodliteResult<Option<(String, u32)>> {
        if !self.adds_current_user() {
            return Ok(None);
        }
        let uid = self.caps.rootless_uid();
        let Some(host) = user::find_user(self.host_passwd, &uid.to_string())? else {
            tracing::debug!(uid, "current user not in host passwd, skipping entry");
            return Ok(None);
        };
        if self.image_has_user(image, &host.name, uid) {
            return Ok(None);
        }
        let home = if self.home_is_mounted(&host.home) {
            host.home.clone()
        } else {
            self.config.work_dir()
        };
        let line = self.passwd_line(&host.name, uid, self.caps.rootless_gid(), &host.gecos, &home);
        Ok(Some((line, uid)))
    }

    /// Entry for a numeric container user missing from the image.
    fn container_user_entry(
        &self,
        image: &[PasswdEntry],
        skip_uid: Option<u32>,
    ) -> PodliteResult<Option<String>> {
        if self.config.user.is_empty() || self.config.is_host_user() {
            return Ok(None);
        }
        let (user_part, group_part) = self.user_parts();
        let Ok(uid) = user_part.parse::<u32>() else {
            return Ok(None);
        };
        if skip_uid == Some(uid) || image.iter().any(|e| e.uid == uid) {
            return Ok(None);
        }
        let gid = match group_part.filter(|g| !g.is_empty()) {
            None => 0,
            Some(g) => match g.parse::<u32>() {
                Ok(gid) => gid,
                Err(_) => user::find_group(&self.image_group()?, g)?
                    .map(|entry| entry.gid)
                    .ok_or_else(|| {
                        PodliteError::InvalidArgument(format!(
                            "unable to find group {} in the image",
                            g
                        ))
                    })?,
            },
        };
        Ok(Some(self.passwd_line(
            user_part,
            uid,
            gid,
            "container user",
            &self.config.work_dir(),
        )))
    }

    /// Host users copied into the container.
    fn host_user_entries(&self, image: &[PasswdEntry]) -> PodliteResult<String> {
        let mut out = String::new();
        for name in &self.config.host_users {
            let host = user::find_user(self.host_passwd, name)?.ok_or_else(|| {
                PodliteError::NotFound(format!("user {} in host passwd file", name))
            })?;
            if self.image_has_user(image, &host.name, host.uid) {
                continue;
            }
            out.push_str(&format!(
                "{}:x:{}:{}:{}:{}:{}\n",
                host.name, host.uid, host.gid, host.gecos, host.home, host.shell
            ));
        }
        Ok(out)
    }

    /// Lines to add to the passwd file and the UID added for the current user.
    pub fn passwd_entries(&self) -> PodliteResult<(String, Option<u32>)> {
        if !self.wants_entries() {
            return Ok((String::new(), None));
        }
        let image = user::parse_passwd(&read_optional(&self.image_passwd()?)?);

        let mut out = String::new();
        let mut added_uid = None;
        if let Some((line, uid)) = self.current_user_entry(&image)? {
            out.push_str(&line);
            added_uid = Some(uid);
        }
        if let Some(line) = self.container_user_entry(&image, added_uid)? {
            out.push_str(&line);
        }
        out.push_str(&self.host_user_entries(&image)?);
        Ok((out, added_uid))
    }

    fn image_has_group(entries: &[GroupEntry], name: &str, gid: u32) -> bool {
        entries.iter().any(|g| g.name == name || g.gid == gid)
    }

    /// Lines to add to the group file.
    pub fn group_entries(&self) -> PodliteResult<String> {
        if !self.wants_entries() {
            return Ok(String::new());
        }
        let image = user::parse_group(&read_optional(&self.image_group()?)?);
        let host_group = self.host_group();
        let mut out = String::new();
        let mut added_gid = None;

        if self.adds_current_user() {
            let gid = self.caps.rootless_gid();
            let username = user::find_user(self.host_passwd, &self.caps.rootless_uid().to_string())?
                .map(|u| u.name);
            if let Some(username) = username {
                let group_name = user::find_group(&host_group, &gid.to_string())?
                    .map(|g| g.name)
                    .unwrap_or_else(|| username.clone());
                if !Self::image_has_group(&image, &group_name, gid) {
                    out.push_str(&format!("{}:x:{}:{}\n", group_name, gid, username));
                    added_gid = Some(gid);
                }
            }
        }

        if !self.config.user.is_empty() && !self.config.is_host_user() {
            let (user_part, group_part) = self.user_parts();
            let group = group_part.filter(|g| !g.is_empty()).unwrap_or(user_part);
            if let Ok(gid) = group.parse::<u32>()
                && added_gid != Some(gid)
                && !image.iter().any(|g| g.gid == gid)
            {
                out.push_str(&format!("{}:x:{}:{}\n", gid, gid, user_part));
            }
        }

        for name in &self.config.host_users {
            let Some(host_user) = user::find_user(self.host_passwd, name)? else {
                continue;
            };
            let Some(group) = user::find_group(&host_group, &host_user.gid.to_string())? else {
                continue;
            };
            if !Self::image_has_group(&image, &group.name, group.gid) {
                out.push_str(&format!("{}:x:{}:{}\n", group.name, group.gid, host_user.name));
            }
        }
        Ok(out)
    }
}

fn read_optional(path: &Path) -> PodliteResult<String> {
    match std::fs::read_to_string(path) {
        Ok(c) => Ok(c),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PodliteError::from(e).context(format!("reading {}", path.display()))),
    }
}

/// Add `entries` to the file at `image_path`.
///
/// A read-only rootfs gets a copy in `static_dir` to bind over the original;
/// otherwise the image file is appended to in place.
fn install(
    entries: &str,
    image_path: &Path,
    file_name: &str,
    static_dir: &Path,
    read_only: bool,
) -> PodliteResult<Option<PathBuf>> {
    if read_only {
        let original = read_optional(image_path)?;
        let mut content = original;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(entries);
        let path = crate::util::write_file_mode(static_dir, file_name, content.as_bytes(), 0o644)?;
        return Ok(Some(path));
    }

    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(image_path)
        .map_err(|e| {
            PodliteError::Storage(format!(
                "unable to append to container {} file: {}",
                file_name, e
            ))
        })?;
    file.write_all(entries.as_bytes()).map_err(|e| {
        PodliteError::Storage(format!(
            "unable to append to container {} file: {}",
            file_name, e
        ))
    })?;
    Ok(None)
}

/// Generate passwd and group additions.
///
/// Returns files that must be bind-mounted over the image's. Files already
/// generated for a read-only rootfs by an earlier start are reused.
pub(crate) fn generate_passwd_and_group(
    files: &UserFiles<'_>,
    static_dir: &Path,
) -> PodliteResult<GeneratedUserFiles> {
    let mut generated = GeneratedUserFiles::default();
    if !files.wants_entries() {
        return Ok(generated);
    }
    let read_only = files.config.read_only;

    if !mount_exists(&files.config.spec, "/etc/passwd") {
        let existing = static_dir.join("passwd");
        if read_only && existing.exists() {
            generated.passwd = Some(existing);
        } else {
            let (entries, _) = files.passwd_entries()?;
            if !entries.is_empty() {
                tracing::debug!(container_id = %files.config.id, "adding passwd entries");
                generated.passwd =
                    install(&entries, &files.image_passwd()?, "passwd", static_dir, read_only)?;
            }
        }
    }

    if !mount_exists(&files.config.spec, "/etc/group") {
        let existing = static_dir.join("group");
        if read_only && existing.exists() {
            generated.group = Some(existing);
        } else {
            let entries = files.group_entries()?;
            if !entries.is_empty() {
                tracing::debug!(container_id = %files.config.id, "adding group entries");
                generated.group =
                    install(&entries, &files.image_group()?, "group", static_dir, read_only)?;
            }
        }
    }

    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::StaticCapabilities;
    use oci_spec::runtime::ProcessBuilder;

    struct Fixture {
        _dir: tempfile::TempDir,
        rootfs: PathBuf,
        host_passwd: PathBuf,
        static_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
        std::fs::write(rootfs.join("etc/group"), "root:x:0:\nstaff:x:50:\n").unwrap();
        let host = dir.path().join("host");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(
            host.join("passwd"),
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000:Alice:/home/alice:/bin/zsh\n",
        )
        .unwrap();
        std::fs::write(host.join("group"), "root:x:0:\nalice:x:1000:\n").unwrap();
        let static_dir = dir.path().join("static");
        std::fs::create_dir_all(&static_dir).unwrap();
        Fixture {
            rootfs,
            host_passwd: host.join("passwd"),
            static_dir,
            _dir: dir,
        }
    }

    fn config(user: &str, workdir: &str) -> ContainerConfig {
        let mut config = ContainerConfig::new("c");
        config.user = user.to_string();
        let process = ProcessBuilder::default().cwd(workdir).build().unwrap();
        config.spec.set_process(Some(process));
        config
    }

    #[test]
    fn numeric_user_gets_container_user_entry() {
        let fx = fixture();
        let cfg = config("1000", "/srv/app");
        let caps = StaticCapabilities::default();
        let files = UserFiles {
            config: &cfg,
            mountpoint: &fx.rootfs,
            host_passwd: &fx.host_passwd,
            caps: &caps,
        };
        let (entries, added) = files.passwd_entries().unwrap();
        assert_eq!(entries, "1000:*:1000:0:container user:/srv/app:/bin/sh\n");
        assert_eq!(added, None);

        let generated = generate_passwd_and_group(&files, &fx.static_dir).unwrap();
        assert_eq!(generated, GeneratedUserFiles::default());
        let passwd = std::fs::read_to_string(fx.rootfs.join("etc/passwd")).unwrap();
        assert!(passwd.ends_with("1000:*:1000:0:container user:/srv/app:/bin/sh\n"));
        let group = std::fs::read_to_string(fx.rootfs.join("etc/group")).unwrap();
        assert!(group.ends_with("1000:x:1000:1000\n"));

        // second run finds the user and adds nothing
        assert_eq!(files.passwd_entries().unwrap().0, "");
    }

    #[test]
    fn read_only_rootfs_writes_static_copy() {
        let fx = fixture();
        let mut cfg = config("1000:staff", "/");
        cfg.read_only = true;
        let caps = StaticCapabilities::default();
        let files = UserFiles {
            config: &cfg,
            mountpoint: &fx.rootfs,
            host_passwd: &fx.host_passwd,
            caps: &caps,
        };
        let generated = generate_passwd_and_group(&files, &fx.static_dir).unwrap();
        let passwd = generated.passwd.unwrap();
        assert_eq!(passwd, fx.static_dir.join("passwd"));
        assert_eq!(
            std::fs::read_to_string(&passwd).unwrap(),
            "root:x:0:0:root:/root:/bin/sh\n1000:*:1000:50:container user:/:/bin/sh\n"
        );
        // staff exists in the image, no group entry needed
        assert!(generated.group.is_none());
        assert_eq!(
            std::fs::read_to_string(fx.rootfs.join("etc/passwd")).unwrap(),
            "root:x:0:0:root:/root:/bin/sh\n"
        );
    }

    #[test]
    fn named_user_and_disabled_passwd_add_nothing() {
        let fx = fixture();
        let caps = StaticCapabilities::default();
        let cfg = config("root", "/");
        let files = UserFiles {
            config: &cfg,
            mountpoint: &fx.rootfs,
            host_passwd: &fx.host_passwd,
            caps: &caps,
        };
        assert_eq!(files.passwd_entries().unwrap().0, "");

        let mut cfg = config("1234", "/");
        cfg.passwd = Some(false);
        let files = UserFiles { config: &cfg, ..files };
        assert_eq!(
            generate_passwd_and_group(&files, &fx.static_dir).unwrap(),
            GeneratedUserFiles::default()
        );
    }

    #[test]
    fn rootless_current_user_and_template() {
        let fx = fixture();
        let mut cfg = config("", "/work");
        cfg.add_current_user_passwd_entry = true;
        cfg.passwd_entry = Some("$USERNAME:x:$UID:$GID:$NAME:$HOME:/bin/false".into());
        let caps = StaticCapabilities {
            rootless: true,
            uid: 1000,
            gid: 1000,
            ..Default::default()
        };
        let files = UserFiles {
            config: &cfg,
            mountpoint: &fx.rootfs,
            host_passwd: &fx.host_passwd,
            caps: &caps,
        };
        let (entries, added) = files.passwd_entries().unwrap();
        assert_eq!(entries, "alice:x:1000:1000:Alice:/work:/bin/false\n");
        assert_eq!(added, Some(1000));
        assert_eq!(files.group_entries().unwrap(), "alice:x:1000:alice\n");
    }

    #[test]
    fn host_users_are_copied() {
        let fx = fixture();
        let mut cfg = config("", "/");
        cfg.host_users = vec!["alice".into()];
        let caps = StaticCapabilities::default();
        let files = UserFiles {
            config: &cfg,
            mountpoint: &fx.rootfs,
            host_passwd: &fx.host_passwd,
            caps: &caps,
        };
        assert_eq!(
            files.passwd_entries().unwrap().0,
            "alice:x:1000:1000:Alice:/home/alice:/bin/zsh\n"
        );
        assert_eq!(files.group_entries().unwrap(), "alice:x:1000:alice\n");

        let mut missing = config("", "/");
        missing.host_users = vec!["bob".into()];
        let files = UserFiles { config: &missing, ..files };
        assert!(files.passwd_entries().unwrap_err().is_not_found());
    }
}
