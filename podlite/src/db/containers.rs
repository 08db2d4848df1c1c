//! Container records.
//!
//! - ContainerConfig: immutable configuration, written once at creation
//! - ContainerState: mutable state, rewritten by every save
//! - ContainerDependency / ContainerVolume: edges used for in-use checks

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::container::config::ContainerConfig;
use crate::container::state::ContainerState;
use crate::runtime::types::{ContainerID, PodID};
use podlite_shared::errors::{PodliteError, PodliteResult};

use super::{Database, db_err, from_json, lookup_entity_id, to_json};

/// Container storage wrapping Database.
#[derive(Clone)]
pub struct ContainerStore {
    pub(super) db: Database,
}

pub(super) fn id_in_use(conn: &Connection, id: &str) -> PodliteResult<bool> {
    let found: Option<i64> = db_err!(
        conn.query_row("SELECT 1 FROM IDNamespace WHERE Id = ?1", params![id], |row| row.get(0))
            .optional()
    )?;
    Ok(found.is_some())
}

/// Containers and pods share one name namespace.
pub(super) fn name_in_use(conn: &Connection, name: &str) -> PodliteResult<bool> {
    let found: Option<i64> = db_err!(
        conn.query_row(
            "SELECT 1 FROM ContainerConfig WHERE Name = ?1 UNION SELECT 1 FROM PodConfig WHERE Name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
    )?;
    Ok(found.is_some())
}

pub(super) fn pod_exists(conn: &Connection, id: &PodID) -> PodliteResult<bool> {
    let found: Option<i64> = db_err!(
        conn.query_row("SELECT 1 FROM PodConfig WHERE Id = ?1", params![id], |row| row.get(0))
            .optional()
    )?;
    Ok(found.is_some())
}

pub(super) fn load_config(conn: &Connection, id: &str) -> PodliteResult<ContainerConfig> {
    let json: Option<String> = db_err!(
        conn.query_row(
            "SELECT Json FROM ContainerConfig WHERE Id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
    )?;
    match json {
        Some(j) => from_json(&j, "container config"),
        None => Err(PodliteError::NotFound(format!("no container with ID {}", id))),
    }
}

pub(super) fn load_state(conn: &Connection, id: &str) -> PodliteResult<ContainerState> {
    let json: Option<String> = db_err!(
        conn.query_row(
            "SELECT Json FROM ContainerState WHERE Id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
    )?;
    match json {
        Some(j) => from_json(&j, "container state"),
        None => Err(PodliteError::NotFound(format!("no state for container {}", id))),
    }
}

/// IDs of containers that depend on `id`.
pub(super) fn dependents(conn: &Connection, id: &str) -> PodliteResult<Vec<ContainerID>> {
    let mut stmt = db_err!(conn.prepare(
        "SELECT Id FROM ContainerDependency WHERE DependencyID = ?1 ORDER BY Id"
    ))?;
    let rows = db_err!(stmt.query_map(params![id], |row| row.get(0)))?;
    db_err!(rows.collect::<Result<Vec<ContainerID>, _>>())
}

/// Delete every row belonging to a container. The caller checks membership.
pub(super) fn delete_container_rows(tx: &Transaction<'_>, id: &ContainerID) -> PodliteResult<()> {
    let users = dependents(tx, id.as_str())?;
    if !users.is_empty() {
        let list: Vec<&str> = users.iter().map(|u| u.as_str()).collect();
        return Err(PodliteError::Busy(format!(
            "container {} has dependent containers which must be removed before it: {}",
            id,
            list.join(", ")
        )));
    }

    let sessions: i64 = db_err!(tx.query_row(
        "SELECT COUNT(*) FROM ContainerExecSession WHERE ContainerID = ?1",
        params![id],
        |row| row.get(0),
    ))?;
    if sessions > 0 {
        return Err(PodliteError::Busy(format!(
            "container {} has active exec sessions",
            id
        )));
    }

    for sql in [
        "DELETE FROM ContainerDependency WHERE Id = ?1",
        "DELETE FROM ContainerVolume WHERE ContainerID = ?1",
        "DELETE FROM ContainerConfig WHERE Id = ?1",
        "DELETE FROM ContainerState WHERE Id = ?1",
        "DELETE FROM IDNamespace WHERE Id = ?1",
    ] {
        db_err!(tx.execute(sql, params![id]))?;
    }
    Ok(())
}

impl ContainerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ========================================================================
    // Add / remove
    // ========================================================================

    /// Add a container that is not part of a pod.
    pub fn add(&self, config: &ContainerConfig, state: &ContainerState) -> PodliteResult<()> {
        if let Some(pod) = &config.pod {
            return Err(PodliteError::InvalidArgument(format!(
                "container {} is part of pod {}, add it to the pod instead",
                config.id, pod
            )));
        }
        self.add_internal(config, state)
    }

    /// Add a container that is a member of `pod_id`.
    pub fn add_to_pod(
        &self,
        pod_id: &PodID,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> PodliteResult<()> {
        if config.pod.as_ref() != Some(pod_id) {
            return Err(PodliteError::InvalidArgument(format!(
                "container {} is not part of pod {}",
                config.id, pod_id
            )));
        }
        self.add_internal(config, state)
    }

    fn add_internal(&self, config: &ContainerConfig, state: &ContainerState) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        if id_in_use(&tx, config.id.as_str())? {
            return Err(PodliteError::IdExists(format!(
                "container ID {} is already in use",
                config.id
            )));
        }
        if name_in_use(&tx, &config.name)? {
            return Err(PodliteError::NameExists(format!(
                "name {} is in use",
                config.name
            )));
        }
        if let Some(pod) = &config.pod
            && !pod_exists(&tx, pod)?
        {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", pod)));
        }

        let deps = config.all_dependencies();
        for dep in &deps {
            let dep_pod: Option<Option<String>> = db_err!(
                tx.query_row(
                    "SELECT PodID FROM ContainerConfig WHERE Id = ?1",
                    params![dep],
                    |row| row.get(0),
                )
                .optional()
            )?;
            let dep_pod = dep_pod.ok_or_else(|| {
                PodliteError::NotFound(format!(
                    "container {} depends on container {} which does not exist",
                    config.id, dep
                ))
            })?;
            match (config.pod.as_ref().map(|p| p.as_str()), dep_pod.as_deref()) {
                (None, Some(dep_pod)) => {
                    return Err(PodliteError::InvalidArgument(format!(
                        "container {} depends on container {} which is in pod {}, but is not in a pod",
                        config.id, dep, dep_pod
                    )));
                }
                (Some(pod), None) => {
                    return Err(PodliteError::InvalidArgument(format!(
                        "container {} is in pod {} but depends on container {} which is not in a pod",
                        config.id, pod, dep
                    )));
                }
                (Some(pod), Some(dep_pod)) if pod != dep_pod => {
                    return Err(PodliteError::InvalidArgument(format!(
                        "container {} is in pod {} but depends on container {} in pod {}",
                        config.id, pod, dep, dep_pod
                    )));
                }
                _ => {}
            }
        }

        for vol in &config.named_volumes {
            let exists: Option<i64> = db_err!(
                tx.query_row(
                    "SELECT 1 FROM VolumeConfig WHERE Name = ?1",
                    params![vol.name],
                    |row| row.get(0),
                )
                .optional()
            )?;
            if exists.is_none() {
                return Err(PodliteError::NotFound(format!(
                    "container {} uses volume {} which does not exist",
                    config.id, vol.name
                )));
            }
        }

        db_err!(tx.execute("INSERT INTO IDNamespace VALUES (?1)", params![config.id]))?;
        db_err!(tx.execute(
            "INSERT INTO ContainerConfig VALUES (?1, ?2, ?3, ?4)",
            params![
                config.id,
                config.name,
                config.pod,
                to_json(config, "container config")?
            ],
        ))?;
        db_err!(tx.execute(
            "INSERT INTO ContainerState VALUES (?1, ?2, ?3, ?4)",
            params![
                config.id,
                state.status.as_i32(),
                state.exit_code,
                to_json(state, "container state")?
            ],
        ))?;
        for dep in &deps {
            db_err!(tx.execute(
                "INSERT INTO ContainerDependency VALUES (?1, ?2)",
                params![config.id, dep],
            ))?;
        }
        for vol in &config.named_volumes {
            db_err!(tx.execute(
                "INSERT OR IGNORE INTO ContainerVolume VALUES (?1, ?2)",
                params![config.id, vol.name],
            ))?;
        }

        db_err!(tx.commit())?;
        tracing::debug!(container_id = %config.id, name = %config.name, "added container to state");
        Ok(())
    }

    /// Remove a container that is not part of a pod.
    pub fn remove(&self, config: &ContainerConfig) -> PodliteResult<()> {
        if let Some(pod) = &config.pod {
            return Err(PodliteError::InvalidArgument(format!(
                "container {} is part of pod {}, remove it from the pod instead",
                config.id, pod
            )));
        }

        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;
        if !id_in_use(&tx, config.id.as_str())? {
            return Err(PodliteError::NotFound(format!("no container with ID {}", config.id)));
        }
        delete_container_rows(&tx, &config.id)?;
        db_err!(tx.commit())?;

        tracing::debug!(container_id = %config.id, "removed container from state");
        Ok(())
    }

    /// Remove a member container from its pod.
    pub fn remove_from_pod(&self, pod_id: &PodID, config: &ContainerConfig) -> PodliteResult<()> {
        if config.pod.as_ref() != Some(pod_id) {
            return Err(PodliteError::InvalidArgument(format!(
                "container {} is not part of pod {}",
                config.id, pod_id
            )));
        }

        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;
        if !pod_exists(&tx, pod_id)? {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", pod_id)));
        }
        let member: Option<i64> = db_err!(
            tx.query_row(
                "SELECT 1 FROM ContainerConfig WHERE Id = ?1 AND PodID = ?2",
                params![config.id, pod_id],
                |row| row.get(0),
            )
            .optional()
        )?;
        if member.is_none() {
            return Err(PodliteError::NotFound(format!(
                "no container {} in pod {}",
                config.id, pod_id
            )));
        }
        let infra: Option<i64> = db_err!(
            tx.query_row(
                "SELECT 1 FROM PodState WHERE Id = ?1 AND InfraContainerId = ?2",
                params![pod_id, config.id],
                |row| row.get(0),
            )
            .optional()
        )?;
        if infra.is_some() {
            return Err(PodliteError::InvalidArgument(format!(
                "container {} is the infra container of pod {} and can only be removed with the pod",
                config.id, pod_id
            )));
        }

        delete_container_rows(&tx, &config.id)?;
        db_err!(tx.commit())?;

        tracing::debug!(container_id = %config.id, pod_id = %pod_id, "removed container from pod");
        Ok(())
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    pub fn config(&self, id: &ContainerID) -> PodliteResult<ContainerConfig> {
        load_config(&self.db.conn(), id.as_str())
    }

    pub fn state(&self, id: &ContainerID) -> PodliteResult<ContainerState> {
        load_state(&self.db.conn(), id.as_str())
    }

    pub fn get(&self, id: &ContainerID) -> PodliteResult<(ContainerConfig, ContainerState)> {
        let conn = self.db.conn();
        Ok((load_config(&conn, id.as_str())?, load_state(&conn, id.as_str())?))
    }

    pub fn has(&self, id: &ContainerID) -> PodliteResult<bool> {
        let conn = self.db.conn();
        let found: Option<i64> = db_err!(
            conn.query_row(
                "SELECT 1 FROM ContainerConfig WHERE Id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        )?;
        Ok(found.is_some())
    }

    pub fn name(&self, id: &ContainerID) -> PodliteResult<String> {
        let conn = self.db.conn();
        let name: Option<String> = db_err!(
            conn.query_row(
                "SELECT Name FROM ContainerConfig WHERE Id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        )?;
        name.ok_or_else(|| PodliteError::NotFound(format!("no container with ID {}", id)))
    }

    /// Resolve a full ID, a unique ID prefix, or a name to a container ID.
    pub fn lookup_id(&self, id_or_name: &str) -> PodliteResult<ContainerID> {
        lookup_entity_id(&self.db.conn(), "ContainerConfig", "container", id_or_name)
    }

    pub fn lookup(&self, id_or_name: &str) -> PodliteResult<(ContainerConfig, ContainerState)> {
        let id = self.lookup_id(id_or_name)?;
        self.get(&id)
    }

    /// Every container as (config, state), in insertion order.
    pub fn all(&self) -> PodliteResult<Vec<(ContainerConfig, ContainerState)>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT ContainerConfig.Json, ContainerState.Json FROM ContainerConfig \
             INNER JOIN ContainerState ON ContainerConfig.Id = ContainerState.Id \
             ORDER BY ContainerConfig.rowid"
        ))?;
        let rows = db_err!(stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        }))?;

        let mut result = Vec::new();
        for row in rows {
            let (config_json, state_json) = db_err!(row)?;
            result.push((
                from_json(&config_json, "container config")?,
                from_json(&state_json, "container state")?,
            ));
        }
        Ok(result)
    }

    /// Containers that depend on `id`.
    pub fn in_use(&self, id: &ContainerID) -> PodliteResult<Vec<ContainerID>> {
        let conn = self.db.conn();
        if load_config(&conn, id.as_str()).is_err() {
            return Err(PodliteError::NotFound(format!("no container with ID {}", id)));
        }
        dependents(&conn, id.as_str())
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Persist a container's state. Fails with not-found if it was removed.
    pub fn save(&self, id: &ContainerID, state: &ContainerState) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE ContainerState SET State = ?1, ExitCode = ?2, Json = ?3 WHERE Id = ?4",
            params![
                state.status.as_i32(),
                state.exit_code,
                to_json(state, "container state")?,
                id
            ],
        ))?;

        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no container with ID {}", id)));
        }
        Ok(())
    }

    /// Reload `state` from the store.
    pub fn update(&self, id: &ContainerID, state: &mut ContainerState) -> PodliteResult<()> {
        *state = self.state(id)?;
        Ok(())
    }

    // ========================================================================
    // Config rewrite
    // ========================================================================

    /// Replace a container's configuration wholesale.
    ///
    /// Nothing is checked beyond existence: dependency edges, pod membership
    /// and the lock ID in the new configuration are trusted as given.
    pub fn rewrite_config(&self, config: &ContainerConfig) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE ContainerConfig SET Name = ?1, Json = ?2 WHERE Id = ?3",
            params![config.name, to_json(config, "container config")?, config.id],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no container with ID {}", config.id)));
        }
        Ok(())
    }

    /// Replace a container's configuration, optionally renaming it.
    ///
    /// The new configuration may not change dependencies, pod membership or
    /// the lock ID. A rename needs both the old and the new name.
    pub fn safe_rewrite_config(
        &self,
        old_name: &str,
        new_name: &str,
        config: &ContainerConfig,
    ) -> PodliteResult<()> {
        if !new_name.is_empty() && old_name.is_empty() {
            return Err(PodliteError::InvalidArgument(
                "must provide old name when renaming a container".into(),
            ));
        }
        if !new_name.is_empty() && config.name != new_name {
            return Err(PodliteError::InvalidArgument(format!(
                "new name {} does not match configuration name {}",
                new_name, config.name
            )));
        }

        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        let current = load_config(&tx, config.id.as_str())?;
        if current.pod != config.pod {
            return Err(PodliteError::InvalidArgument(format!(
                "cannot change pod membership of container {}",
                config.id
            )));
        }
        if current.lock_id != config.lock_id {
            return Err(PodliteError::InvalidArgument(format!(
                "cannot change lock of container {}",
                config.id
            )));
        }
        if current.all_dependencies() != config.all_dependencies() {
            return Err(PodliteError::InvalidArgument(format!(
                "cannot change dependencies of container {}",
                config.id
            )));
        }

        let name = if new_name.is_empty() {
            if config.name != current.name {
                return Err(PodliteError::InvalidArgument(format!(
                    "configuration renames container {} without a new name",
                    config.id
                )));
            }
            current.name.clone()
        } else {
            if current.name != old_name {
                return Err(PodliteError::InvalidArgument(format!(
                    "container {} is named {}, not {}",
                    config.id, current.name, old_name
                )));
            }
            if new_name != old_name && name_in_use(&tx, new_name)? {
                return Err(PodliteError::NameExists(format!("name {} is in use", new_name)));
            }
            new_name.to_string()
        };

        db_err!(tx.execute(
            "UPDATE ContainerConfig SET Name = ?1, Json = ?2 WHERE Id = ?3",
            params![name, to_json(config, "container config")?, config.id],
        ))?;
        db_err!(tx.commit())?;
        Ok(())
    }
}
