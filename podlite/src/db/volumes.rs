//! Volume records. Volumes are keyed by name, not ID.

use rusqlite::{OptionalExtension, params};

use crate::runtime::types::ContainerID;
use crate::volume::config::{VolumeConfig, VolumeState};
use podlite_shared::errors::{PodliteError, PodliteResult};

use super::{Database, db_err, from_json, like_prefix, to_json};

/// Volume storage wrapping Database.
#[derive(Clone)]
pub struct VolumeStore {
    db: Database,
}

impl VolumeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn add(&self, config: &VolumeConfig, state: &VolumeState) -> PodliteResult<()> {
        config.validate()?;

        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        let exists: Option<i64> = db_err!(
            tx.query_row(
                "SELECT 1 FROM VolumeConfig WHERE Name = ?1",
                params![config.name],
                |row| row.get(0),
            )
            .optional()
        )?;
        if exists.is_some() {
            return Err(PodliteError::NameExists(format!(
                "volume with name {} already exists",
                config.name
            )));
        }

        db_err!(tx.execute(
            "INSERT INTO VolumeConfig VALUES (?1, ?2, ?3)",
            params![config.name, config.storage_id, to_json(config, "volume config")?],
        ))?;
        db_err!(tx.execute(
            "INSERT INTO VolumeState VALUES (?1, ?2)",
            params![config.name, to_json(state, "volume state")?],
        ))?;

        db_err!(tx.commit())?;
        tracing::debug!(volume = %config.name, driver = %config.driver, "added volume to state");
        Ok(())
    }

    /// Remove an unused volume.
    pub fn remove(&self, name: &str) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        let users: Vec<String> = {
            let mut stmt = db_err!(tx.prepare(
                "SELECT ContainerID FROM ContainerVolume WHERE VolumeName = ?1 ORDER BY ContainerID"
            ))?;
            let rows = db_err!(stmt.query_map(params![name], |row| row.get(0)))?;
            db_err!(rows.collect::<Result<Vec<String>, _>>())?
        };
        if !users.is_empty() {
            return Err(PodliteError::Busy(format!(
                "volume {} is being used by the following container(s): {}",
                name,
                users.join(", ")
            )));
        }

        let rows_affected = db_err!(tx.execute(
            "DELETE FROM VolumeConfig WHERE Name = ?1",
            params![name],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no volume with name {}", name)));
        }
        db_err!(tx.execute("DELETE FROM VolumeState WHERE Name = ?1", params![name]))?;
        db_err!(tx.commit())?;

        tracing::debug!(volume = %name, "removed volume from state");
        Ok(())
    }

    pub fn volume(&self, name: &str) -> PodliteResult<(VolumeConfig, VolumeState)> {
        let conn = self.db.conn();
        let row: Option<(String, String)> = db_err!(
            conn.query_row(
                "SELECT VolumeConfig.Json, VolumeState.Json FROM VolumeConfig \
                 INNER JOIN VolumeState ON VolumeConfig.Name = VolumeState.Name \
                 WHERE VolumeConfig.Name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        )?;
        let (config_json, state_json) =
            row.ok_or_else(|| PodliteError::NotFound(format!("no volume with name {}", name)))?;
        Ok((
            from_json(&config_json, "volume config")?,
            from_json(&state_json, "volume state")?,
        ))
    }

    /// Resolve an exact name, or a unique name prefix.
    pub fn lookup(&self, name: &str) -> PodliteResult<(VolumeConfig, VolumeState)> {
        if name.is_empty() {
            return Err(PodliteError::InvalidArgument(
                "must provide a non-empty volume name".into(),
            ));
        }

        let full_name = {
            let conn = self.db.conn();
            let exact: Option<String> = db_err!(
                conn.query_row(
                    "SELECT Name FROM VolumeConfig WHERE Name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
            )?;
            match exact {
                Some(n) => n,
                None => {
                    let mut stmt = db_err!(conn.prepare(
                        "SELECT Name FROM VolumeConfig WHERE Name LIKE ?1 ESCAPE '\\'"
                    ))?;
                    let rows = db_err!(stmt.query_map(params![like_prefix(name)], |row| row.get(0)))?;
                    let mut matches = db_err!(rows.collect::<Result<Vec<String>, _>>())?;
                    if matches.len() > 1 {
                        return Err(PodliteError::InvalidArgument(format!(
                            "more than one result for volume name {}",
                            name
                        )));
                    }
                    matches.pop().ok_or_else(|| {
                        PodliteError::NotFound(format!("no volume with name {}", name))
                    })?
                }
            }
        };
        self.volume(&full_name)
    }

    pub fn has(&self, name: &str) -> PodliteResult<bool> {
        let conn = self.db.conn();
        let found: Option<i64> = db_err!(
            conn.query_row(
                "SELECT 1 FROM VolumeConfig WHERE Name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
        )?;
        Ok(found.is_some())
    }

    pub fn all(&self) -> PodliteResult<Vec<(VolumeConfig, VolumeState)>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT VolumeConfig.Json, VolumeState.Json FROM VolumeConfig \
             INNER JOIN VolumeState ON VolumeConfig.Name = VolumeState.Name \
             ORDER BY VolumeConfig.Name"
        ))?;
        let rows = db_err!(stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        }))?;

        let mut result = Vec::new();
        for row in rows {
            let (config_json, state_json) = db_err!(row)?;
            result.push((
                from_json(&config_json, "volume config")?,
                from_json(&state_json, "volume state")?,
            ));
        }
        Ok(result)
    }

    /// Containers using the volume.
    pub fn in_use(&self, name: &str) -> PodliteResult<Vec<ContainerID>> {
        if !self.has(name)? {
            return Err(PodliteError::NotFound(format!("no volume with name {}", name)));
        }
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT ContainerID FROM ContainerVolume WHERE VolumeName = ?1 ORDER BY ContainerID"
        ))?;
        let rows = db_err!(stmt.query_map(params![name], |row| row.get(0)))?;
        db_err!(rows.collect::<Result<Vec<ContainerID>, _>>())
    }

    /// Whether a storage container backs a volume.
    pub fn container_id_is_volume(&self, storage_id: &str) -> PodliteResult<bool> {
        let conn = self.db.conn();
        let found: Option<i64> = db_err!(
            conn.query_row(
                "SELECT 1 FROM VolumeConfig WHERE StorageID = ?1",
                params![storage_id],
                |row| row.get(0),
            )
            .optional()
        )?;
        Ok(found.is_some())
    }

    pub fn save(&self, name: &str, state: &VolumeState) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE VolumeState SET Json = ?1 WHERE Name = ?2",
            params![to_json(state, "volume state")?, name],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no volume with name {}", name)));
        }
        Ok(())
    }

    pub fn update(&self, name: &str, state: &mut VolumeState) -> PodliteResult<()> {
        *state = self.volume(name)?.1;
        Ok(())
    }

    /// Replace a volume's configuration. The name is the key and cannot change.
    pub fn rewrite_config(&self, config: &VolumeConfig) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "UPDATE VolumeConfig SET StorageID = ?1, Json = ?2 WHERE Name = ?3",
            params![config.storage_id, to_json(config, "volume config")?, config.name],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!("no volume with name {}", config.name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::{ContainerConfig, NamedVolume};
    use crate::container::state::ContainerState;
    use crate::db::ContainerStore;
    use tempfile::tempdir;

    fn create_test_stores() -> (VolumeStore, ContainerStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("test.db")).unwrap();
        (VolumeStore::new(db.clone()), ContainerStore::new(db), dir)
    }

    #[test]
    fn test_add_duplicate_name() {
        let (store, _ctrs, _dir) = create_test_stores();
        let cfg = VolumeConfig::new("data");
        store.add(&cfg, &VolumeState::default()).unwrap();
        assert!(matches!(
            store.add(&cfg, &VolumeState::default()),
            Err(PodliteError::NameExists(_))
        ));
    }

    #[test]
    fn test_in_use_blocks_remove() {
        let (store, ctrs, _dir) = create_test_stores();
        store.add(&VolumeConfig::new("data"), &VolumeState::default()).unwrap();

        let mut ctr = ContainerConfig::new("db");
        ctr.named_volumes.push(NamedVolume {
            name: "data".into(),
            dest: "/var/lib/db".into(),
            options: vec![],
            sub_path: None,
        });
        ctrs.add(&ctr, &ContainerState::default()).unwrap();

        assert_eq!(store.in_use("data").unwrap(), vec![ctr.id.clone()]);
        assert!(store.remove("data").unwrap_err().is_busy());

        ctrs.remove(&ctr).unwrap();
        store.remove("data").unwrap();
        assert!(store.remove("data").unwrap_err().is_not_found());
    }

    #[test]
    fn test_lookup_prefix_and_state_save() {
        let (store, _ctrs, _dir) = create_test_stores();
        store.add(&VolumeConfig::new("cache-a"), &VolumeState::default()).unwrap();
        store.add(&VolumeConfig::new("cache-b"), &VolumeState::default()).unwrap();

        assert_eq!(store.lookup("cache-a").unwrap().0.name, "cache-a");
        assert!(store.lookup("cache").is_err());
        assert!(store.lookup("zzz").unwrap_err().is_not_found());

        let state = VolumeState {
            mount_count: 2,
            ..Default::default()
        };
        store.save("cache-b", &state).unwrap();
        let mut cached = VolumeState::default();
        store.update("cache-b", &mut cached).unwrap();
        assert_eq!(cached.mount_count, 2);
        assert!(store.save("missing", &state).unwrap_err().is_not_found());
    }

    #[test]
    fn test_storage_backed_volume() {
        let (store, _ctrs, _dir) = create_test_stores();
        let mut cfg = VolumeConfig::new("img");
        cfg.storage_id = Some("abc".into());
        store.add(&cfg, &VolumeState::default()).unwrap();
        assert!(store.container_id_is_volume("abc").unwrap());
        assert!(!store.container_id_is_volume("def").unwrap());
    }
}
