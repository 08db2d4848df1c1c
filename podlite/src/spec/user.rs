//! passwd/group parsing and user resolution.

use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};

/// One line of a passwd file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

/// One line of a group file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

/// The user a container process runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub sgids: Vec<u32>,
}

impl Default for ExecUser {
    fn default() -> Self {
        Self { uid: 0, gid: 0, home: "/".to_string(), sgids: Vec::new() }
    }
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            if f.len() < 7 {
                return None;
            }
            Some(PasswdEntry {
                name: f[0].to_string(),
                uid: f[2].parse().ok()?,
                gid: f[3].parse().ok()?,
                gecos: f[4].to_string(),
                home: f[5].to_string(),
                shell: f[6].to_string(),
            })
        })
        .collect()
}

pub fn parse_group(content: &str) -> Vec<GroupEntry> {
    content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let f: Vec<&str> = line.split(':').collect();
            if f.len() < 4 {
                return None;
            }
            Some(GroupEntry {
                name: f[0].to_string(),
                gid: f[2].parse().ok()?,
                members: f[3]
                    .split(',')
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Read a file that may legitimately be missing; missing means empty.
fn read_optional(path: &Path) -> PodliteResult<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PodliteError::from(e).context(format!("reading {}", path.display()))),
    }
}

/// Find a user by name or numeric UID.
pub fn find_user(passwd: &Path, user: &str) -> PodliteResult<Option<PasswdEntry>> {
    let entries = parse_passwd(&read_optional(passwd)?);
    let uid = user.parse::<u32>().ok();
    Ok(entries
        .into_iter()
        .find(|e| e.name == user || Some(e.uid) == uid))
}

/// Find a group by name or numeric GID.
pub fn find_group(group: &Path, spec: &str) -> PodliteResult<Option<GroupEntry>> {
    let entries = parse_group(&read_optional(group)?);
    let gid = spec.parse::<u32>().ok();
    Ok(entries
        .into_iter()
        .find(|e| e.name == spec || Some(e.gid) == gid))
}

/// Resolve `user`, `uid`, `user:group` or `uid:gid`.
///
/// A numeric user missing from the passwd file is allowed and runs with
/// GID 0 and `/` as home. A missing name is an error.
pub fn exec_user(passwd: &Path, group: &Path, spec: &str) -> PodliteResult<ExecUser> {
    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    let user_part = if user_part.is_empty() { "0" } else { user_part };

    let mut exec = ExecUser::default();
    let mut user_name = None;
    match find_user(passwd, user_part)? {
        Some(entry) => {
            exec.uid = entry.uid;
            exec.gid = entry.gid;
            if !entry.home.is_empty() {
                exec.home = entry.home;
            }
            user_name = Some(entry.name);
        }
        None => {
            exec.uid = user_part.parse().map_err(|_| {
                PodliteError::InvalidArgument(format!(
                    "unable to find user {}: no matching entries in passwd file",
                    user_part
                ))
            })?;
        }
    }

    if let Some(group_part) = group_part.filter(|g| !g.is_empty()) {
        exec.gid = match group_part.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => find_group(group, group_part)?
                .map(|g| g.gid)
                .ok_or_else(|| {
                    PodliteError::InvalidArgument(format!(
                        "unable to find group {}: no matching entries in group file",
                        group_part
                    ))
                })?,
        };
    }

    if let Some(name) = user_name {
        exec.sgids = parse_group(&read_optional(group)?)
            .into_iter()
            .filter(|g| g.gid != exec.gid && g.members.iter().any(|m| *m == name))
            .map(|g| g.gid)
            .collect();
    }

    Ok(exec)
}

/// GIDs for the supplementary groups given by name or number.
pub fn group_ids(group: &Path, groups: &[String]) -> PodliteResult<Vec<u32>> {
    let mut gids = Vec::with_capacity(groups.len());
    for spec in groups {
        let gid = match spec.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => find_group(group, spec)?.map(|g| g.gid).ok_or_else(|| {
                PodliteError::InvalidArgument(format!("unable to find group {}", spec))
            })?,
        };
        if !gids.contains(&gid) {
            gids.push(gid);
        }
    }
    Ok(gids)
}
