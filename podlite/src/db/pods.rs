//! Pod records and pod membership.

use rusqlite::{OptionalExtension, params};

use crate::container::config::ContainerConfig;
use crate::container::state::ContainerState;
use crate::pod::{PodConfig, PodState};
use crate::runtime::types::{ContainerID, PodID};
use podlite_shared::errors::{PodliteError, PodliteResult};

use super::containers::{id_in_use, load_config, load_state, name_in_use, pod_exists};
use super::{Database, db_err, from_json, lookup_entity_id, to_json};

/// Pod storage wrapping Database.
#[derive(Clone)]
pub struct PodStore {
    db: Database,
}

impl PodStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ========================================================================
    // Add / remove
    // ========================================================================

    pub fn add(&self, config: &PodConfig, state: &PodState) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        if id_in_use(&tx, config.id.as_str())? {
            return Err(PodliteError::IdExists(format!(
                "pod ID {} is already in use",
                config.id
            )));
        }
        if name_in_use(&tx, &config.name)? {
            return Err(PodliteError::NameExists(format!("name {} is in use", config.name)));
        }

        db_err!(tx.execute("INSERT INTO IDNamespace VALUES (?1)", params![config.id]))?;
        db_err!(tx.execute(
            "INSERT INTO PodConfig VALUES (?1, ?2, ?3)",
            params![config.id, config.name, to_json(config, "pod config")?],
        ))?;
        db_err!(tx.execute(
            "INSERT INTO PodState VALUES (?1, ?2, ?3)",
            params![
                config.id,
                state.infra_container_id,
                to_json(state, "pod state")?
            ],
        ))?;

        db_err!(tx.commit())?;
        tracing::debug!(pod_id = %config.id, name = %config.name, "added pod to state");
        Ok(())
    }

    /// Remove an empty pod.
    pub fn remove(&self, id: &PodID) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        if !pod_exists(&tx, id)? {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", id)));
        }
        let members: i64 = db_err!(tx.query_row(
            "SELECT COUNT(*) FROM ContainerConfig WHERE PodID = ?1",
            params![id],
            |row| row.get(0),
        ))?;
        if members > 0 {
            return Err(PodliteError::Busy(format!(
                "pod {} still has {} containers",
                id, members
            )));
        }

        for sql in [
            "DELETE FROM PodConfig WHERE Id = ?1",
            "DELETE FROM PodState WHERE Id = ?1",
            "DELETE FROM IDNamespace WHERE Id = ?1",
        ] {
            db_err!(tx.execute(sql, params![id]))?;
        }
        db_err!(tx.commit())?;

        tracing::debug!(pod_id = %id, "removed pod from state");
        Ok(())
    }

    /// Remove every member container of a pod in one transaction.
    ///
    /// Dependencies between members, the infra reference and exec sessions
    /// are dropped along with the containers. A member depending on a
    /// container outside the pod is an invalid-argument error.
    pub fn remove_pod_containers(&self, id: &PodID) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        if !pod_exists(&tx, id)? {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", id)));
        }

        let members: Vec<ContainerID> = {
            let mut stmt = db_err!(tx.prepare("SELECT Id FROM ContainerConfig WHERE PodID = ?1"))?;
            let rows = db_err!(stmt.query_map(params![id], |row| row.get(0)))?;
            db_err!(rows.collect::<Result<Vec<ContainerID>, _>>())?
        };

        for member in &members {
            let outside: Option<String> = db_err!(
                tx.query_row(
                    "SELECT ContainerDependency.DependencyID FROM ContainerDependency \
                     INNER JOIN ContainerConfig ON ContainerDependency.DependencyID = ContainerConfig.Id \
                     WHERE ContainerDependency.Id = ?1 AND (ContainerConfig.PodID IS NULL OR ContainerConfig.PodID <> ?2)",
                    params![member, id],
                    |row| row.get(0),
                )
                .optional()
            )?;
            if let Some(dep) = outside {
                return Err(PodliteError::InvalidArgument(format!(
                    "container {} in pod {} depends on container {} outside the pod",
                    member, id, dep
                )));
            }
        }

        db_err!(tx.execute(
            "UPDATE PodState SET InfraContainerId = NULL WHERE Id = ?1",
            params![id],
        ))?;
        for member in &members {
            db_err!(tx.execute("DELETE FROM ContainerDependency WHERE Id = ?1", params![member]))?;
        }
        for member in &members {
            for sql in [
                "DELETE FROM ContainerExecSession WHERE ContainerID = ?1",
                "DELETE FROM ContainerVolume WHERE ContainerID = ?1",
                "DELETE FROM ContainerConfig WHERE Id = ?1",
                "DELETE FROM ContainerState WHERE Id = ?1",
                "DELETE FROM IDNamespace WHERE Id = ?1",
            ] {
                db_err!(tx.execute(sql, params![member]))?;
            }
        }

        // The infra reference lives in the pod state blob too.
        let state_json: String = db_err!(tx.query_row(
            "SELECT Json FROM PodState WHERE Id = ?1",
            params![id],
            |row| row.get(0),
        ))?;
        let mut state: PodState = from_json(&state_json, "pod state")?;
        state.infra_container_id = None;
        db_err!(tx.execute(
            "UPDATE PodState SET Json = ?1 WHERE Id = ?2",
            params![to_json(&state, "pod state")?, id],
        ))?;

        db_err!(tx.commit())?;
        tracing::debug!(pod_id = %id, count = members.len(), "removed pod containers from state");
        Ok(())
    }

    // ========================================================================
    // Retrieval
    // ========================================================================

    pub fn pod(&self, id: &PodID) -> PodliteResult<(PodConfig, PodState)> {
        let conn = self.db.conn();
        let row: Option<(String, String)> = db_err!(
            conn.query_row(
                "SELECT PodConfig.Json, PodState.Json FROM PodConfig \
                 INNER JOIN PodState ON PodConfig.Id = PodState.Id WHERE PodConfig.Id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        )?;
        let (config_json, state_json) =
            row.ok_or_else(|| PodliteError::NotFound(format!("no pod with ID {}", id)))?;
        Ok((
            from_json(&config_json, "pod config")?,
            from_json(&state_json, "pod state")?,
        ))
    }

    pub fn lookup_id(&self, id_or_name: &str) -> PodliteResult<PodID> {
        lookup_entity_id(&self.db.conn(), "PodConfig", "pod", id_or_name)
    }

    pub fn lookup(&self, id_or_name: &str) -> PodliteResult<(PodConfig, PodState)> {
        let id = self.lookup_id(id_or_name)?;
        self.pod(&id)
    }

    pub fn has(&self, id: &PodID) -> PodliteResult<bool> {
        pod_exists(&self.db.conn(), id)
    }

    pub fn has_container(&self, pod: &PodID, ctr: &ContainerID) -> PodliteResult<bool> {
        let conn = self.db.conn();
        if !pod_exists(&conn, pod)? {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", pod)));
        }
        let found: Option<i64> = db_err!(
            conn.query_row(
                "SELECT 1 FROM ContainerConfig WHERE Id = ?1 AND PodID = ?2",
                params![ctr, pod],
                |row| row.get(0),
            )
            .optional()
        )?;
        Ok(found.is_some())
    }

    pub fn containers_by_id(&self, pod: &PodID) -> PodliteResult<Vec<ContainerID>> {
        let conn = self.db.conn();
        if !pod_exists(&conn, pod)? {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", pod)));
        }
        let mut stmt = db_err!(conn.prepare(
            "SELECT Id FROM ContainerConfig WHERE PodID = ?1 ORDER BY rowid"
        ))?;
        let rows = db_err!(stmt.query_map(params![pod], |row| row.get(0)))?;
        db_err!(rows.collect::<Result<Vec<ContainerID>, _>>())
    }

    pub fn containers(&self, pod: &PodID) -> PodliteResult<Vec<(ContainerConfig, ContainerState)>> {
        let ids = self.containers_by_id(pod)?;
        let conn = self.db.conn();
        ids.iter()
            .map(|id| -> PodliteResult<_> {
                Ok((load_config(&conn, id.as_str())?, load_state(&conn, id.as_str())?))
            })
            .collect()
    }

    pub fn all(&self) -> PodliteResult<Vec<(PodConfig, PodState)>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT PodConfig.Json, PodState.Json FROM PodConfig \
             INNER JOIN PodState ON PodConfig.Id = PodState.Id ORDER BY PodConfig.rowid"
        ))?;
        let rows = db_err!(stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        }))?;

        let mut result = Vec::new();
        for row in rows {
            let (config_json, state_json) = db_err!(row)?;
            result.push((
                from_json(&config_json, "pod config")?,
                from_json(&state_json, "pod state")?,
            ));
        }
        Ok(result)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn save(&self, id: &PodID, state: &PodState) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE PodState SET InfraContainerId = ?1, Json = ?2 WHERE Id = ?3",
            params![state.infra_container_id, to_json(state, "pod state")?, id],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", id)));
        }
        Ok(())
    }

    pub fn update(&self, id: &PodID, state: &mut PodState) -> PodliteResult<()> {
        *state = self.pod(id)?.1;
        Ok(())
    }

    /// Replace a pod's configuration. The name is kept in sync.
    pub fn rewrite_config(&self, config: &PodConfig) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE PodConfig SET Name = ?1, Json = ?2 WHERE Id = ?3",
            params![config.name, to_json(config, "pod config")?, config.id],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no pod with ID {}", config.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ContainerStore;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn create_test_stores() -> (PodStore, ContainerStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (PodStore::new(db.clone()), ContainerStore::new(db), dir)
    }

    fn member_of(pod: &PodConfig, name: &str) -> ContainerConfig {
        let mut cfg = ContainerConfig::new(name);
        cfg.pod = Some(pod.id.clone());
        cfg
    }

    #[test]
    fn test_pod_and_container_names_share_namespace() {
        let (pods, ctrs, _dir) = create_test_stores();
        let ctr = ContainerConfig::new("shared");
        ctrs.add(&ctr, &ContainerState::default()).unwrap();

        let pod = PodConfig::new("shared");
        assert!(matches!(
            pods.add(&pod, &PodState::default()),
            Err(PodliteError::NameExists(_))
        ));
    }

    #[test]
    fn test_remove_requires_empty_pod() {
        let (pods, ctrs, _dir) = create_test_stores();
        let pod = PodConfig::new("pod");
        pods.add(&pod, &PodState::default()).unwrap();

        let member = member_of(&pod, "a");
        ctrs.add_to_pod(&pod.id, &member, &ContainerState::new(PathBuf::from("/run/a")))
            .unwrap();
        assert!(pods.has_container(&pod.id, &member.id).unwrap());
        assert!(pods.remove(&pod.id).unwrap_err().is_busy());

        ctrs.remove_from_pod(&pod.id, &member).unwrap();
        pods.remove(&pod.id).unwrap();
        assert!(!pods.has(&pod.id).unwrap());
        assert!(pods.remove(&pod.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_remove_pod_containers_clears_infra_and_dependencies() {
        let (pods, ctrs, _dir) = create_test_stores();
        let pod = PodConfig::new("pod");
        pods.add(&pod, &PodState::default()).unwrap();

        let infra = member_of(&pod, "infra");
        ctrs.add_to_pod(&pod.id, &infra, &ContainerState::default()).unwrap();
        let mut app = member_of(&pod, "app");
        app.namespaces.net = Some(infra.id.clone());
        ctrs.add_to_pod(&pod.id, &app, &ContainerState::default()).unwrap();

        let state = PodState {
            infra_container_id: Some(infra.id.clone()),
            ..Default::default()
        };
        pods.save(&pod.id, &state).unwrap();
        assert_eq!(pods.containers_by_id(&pod.id).unwrap(), vec![infra.id.clone(), app.id.clone()]);

        pods.remove_pod_containers(&pod.id).unwrap();
        assert!(pods.containers(&pod.id).unwrap().is_empty());
        assert!(!ctrs.has(&infra.id).unwrap());
        assert_eq!(pods.pod(&pod.id).unwrap().1.infra_container_id, None);
        pods.remove(&pod.id).unwrap();
    }

    #[test]
    fn test_lookup_and_rewrite() {
        let (pods, _ctrs, _dir) = create_test_stores();
        let mut pod = PodConfig::new("frontend");
        pods.add(&pod, &PodState::default()).unwrap();

        assert_eq!(pods.lookup_id("frontend").unwrap(), pod.id);
        assert_eq!(pods.lookup(&pod.id.as_str()[..12]).unwrap().0, pod);

        pod.cgroup_parent = "machine.slice".into();
        pods.rewrite_config(&pod).unwrap();
        assert_eq!(pods.all().unwrap()[0].0.cgroup_parent, "machine.slice");
    }
}
