//! Exit codes and exec sessions.
//!
//! Both are per-boot records: [`Database::refresh`](super::Database::refresh)
//! empties them after a reboot.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::runtime::types::ContainerID;
use podlite_shared::errors::{PodliteError, PodliteResult};

use super::containers::ContainerStore;
use super::{db_err, to_json};

/// Exit codes older than this are dropped by [`ContainerStore::prune_exit_codes`].
pub const EXIT_CODE_RETENTION_SECS: i64 = 5 * 60;

/// A process executed inside a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSession {
    pub id: String,
    pub container_id: ContainerID,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub pid: Option<i32>,
}

impl ContainerStore {
    // ========================================================================
    // Exit codes
    // ========================================================================

    /// Record the exit code of a container, replacing any older one.
    pub fn add_exit_code(&self, id: &ContainerID, exit_code: i32) -> PodliteResult<()> {
        self.add_exit_code_at(id, exit_code, Utc::now())
    }

    pub(crate) fn add_exit_code_at(
        &self,
        id: &ContainerID,
        exit_code: i32,
        at: DateTime<Utc>,
    ) -> PodliteResult<()> {
        if !(0..=255).contains(&exit_code) {
            return Err(PodliteError::InvalidArgument(format!(
                "exit code {} of container {} is out of range",
                exit_code, id
            )));
        }
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT OR REPLACE INTO ContainerExitCode VALUES (?1, ?2, ?3)",
            params![id, at.timestamp(), exit_code],
        ))?;
        Ok(())
    }

    pub fn exit_code(&self, id: &ContainerID) -> PodliteResult<i32> {
        let conn = self.db.conn();
        let code: Option<i32> = db_err!(
            conn.query_row(
                "SELECT ExitCode FROM ContainerExitCode WHERE Id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        )?;
        code.ok_or_else(|| PodliteError::NotFound(format!("no exit code for container {}", id)))
    }

    pub fn exit_code_timestamp(&self, id: &ContainerID) -> PodliteResult<DateTime<Utc>> {
        let conn = self.db.conn();
        let ts: Option<i64> = db_err!(
            conn.query_row(
                "SELECT Timestamp FROM ContainerExitCode WHERE Id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
        )?;
        let ts =
            ts.ok_or_else(|| PodliteError::NotFound(format!("no exit code for container {}", id)))?;
        Utc.timestamp_opt(ts, 0).single().ok_or_else(|| {
            PodliteError::Database(format!("invalid exit code timestamp {} for {}", ts, id))
        })
    }

    /// Drop exit codes recorded more than five minutes ago.
    pub fn prune_exit_codes(&self) -> PodliteResult<usize> {
        let cutoff = Utc::now().timestamp() - EXIT_CODE_RETENTION_SECS;
        let conn = self.db.conn();
        let pruned = db_err!(conn.execute(
            "DELETE FROM ContainerExitCode WHERE Timestamp <= ?1",
            params![cutoff],
        ))?;
        if pruned > 0 {
            tracing::debug!(pruned, "pruned stale exit codes");
        }
        Ok(pruned)
    }

    // ========================================================================
    // Exec sessions
    // ========================================================================

    pub fn add_exec_session(&self, session: &ExecSession) -> PodliteResult<()> {
        let mut conn = self.db.conn();
        let tx = db_err!(conn.transaction())?;

        let exists: Option<i64> = db_err!(
            tx.query_row(
                "SELECT 1 FROM ContainerConfig WHERE Id = ?1",
                params![session.container_id],
                |row| row.get(0),
            )
            .optional()
        )?;
        if exists.is_none() {
            return Err(PodliteError::NotFound(format!(
                "no container with ID {}",
                session.container_id
            )));
        }
        let duplicate: Option<i64> = db_err!(
            tx.query_row(
                "SELECT 1 FROM ContainerExecSession WHERE Id = ?1",
                params![session.id],
                |row| row.get(0),
            )
            .optional()
        )?;
        if duplicate.is_some() {
            return Err(PodliteError::IdExists(format!(
                "exec session {} already exists",
                session.id
            )));
        }

        db_err!(tx.execute(
            "INSERT INTO ContainerExecSession VALUES (?1, ?2, ?3)",
            params![
                session.id,
                session.container_id,
                to_json(session, "exec session")?
            ],
        ))?;
        db_err!(tx.commit())?;
        Ok(())
    }

    /// The container an exec session belongs to.
    pub fn exec_session(&self, session_id: &str) -> PodliteResult<ContainerID> {
        let conn = self.db.conn();
        let id: Option<ContainerID> = db_err!(
            conn.query_row(
                "SELECT ContainerID FROM ContainerExecSession WHERE Id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
        )?;
        id.ok_or_else(|| PodliteError::NotFound(format!("no exec session with ID {}", session_id)))
    }

    pub fn remove_exec_session(&self, session_id: &str) -> PodliteResult<()> {
        let conn = self.db.conn();
        let rows_affected = db_err!(conn.execute(
            "DELETE FROM ContainerExecSession WHERE Id = ?1",
            params![session_id],
        ))?;
        if rows_affected == 0 {
            return Err(PodliteError::NotFound(format!(
                "no exec session with ID {}",
                session_id
            )));
        }
        Ok(())
    }

    pub fn container_exec_sessions(&self, id: &ContainerID) -> PodliteResult<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare(
            "SELECT Id FROM ContainerExecSession WHERE ContainerID = ?1 ORDER BY Id"
        ))?;
        let rows = db_err!(stmt.query_map(params![id], |row| row.get(0)))?;
        db_err!(rows.collect::<Result<Vec<String>, _>>())
    }

    pub fn remove_container_exec_sessions(&self, id: &ContainerID) -> PodliteResult<()> {
        let conn = self.db.conn();
        db_err!(conn.execute(
            "DELETE FROM ContainerExecSession WHERE ContainerID = ?1",
            params![id],
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::config::ContainerConfig;
    use crate::container::state::ContainerState;
    use crate::db::Database;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn store_with_container() -> (ContainerStore, ContainerConfig, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ContainerStore::new(Database::open(&dir.path().join("test.db")).unwrap());
        let config = ContainerConfig::new("web");
        store
            .add(&config, &ContainerState::new(PathBuf::from("/run/web")))
            .unwrap();
        (store, config, dir)
    }

    #[test]
    fn test_exit_code_replace_and_prune() {
        let (store, config, _dir) = store_with_container();
        assert!(store.exit_code(&config.id).unwrap_err().is_not_found());

        store.add_exit_code(&config.id, 1).unwrap();
        store.add_exit_code(&config.id, 137).unwrap();
        assert_eq!(store.exit_code(&config.id).unwrap(), 137);

        assert_eq!(store.prune_exit_codes().unwrap(), 0);
        let stale = Utc::now() - chrono::Duration::minutes(10);
        store.add_exit_code_at(&config.id, 2, stale).unwrap();
        assert_eq!(store.exit_code_timestamp(&config.id).unwrap().timestamp(), stale.timestamp());
        assert_eq!(store.prune_exit_codes().unwrap(), 1);
        assert!(store.exit_code(&config.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_exit_code_out_of_range() {
        let (store, config, _dir) = store_with_container();
        assert!(store.add_exit_code(&config.id, 300).is_err());
    }

    #[test]
    fn test_exec_sessions() {
        let (store, config, _dir) = store_with_container();
        let session = ExecSession {
            id: "sess1".into(),
            container_id: config.id.clone(),
            command: vec!["sh".into()],
            pid: None,
        };
        store.add_exec_session(&session).unwrap();
        assert!(matches!(
            store.add_exec_session(&session),
            Err(PodliteError::IdExists(_))
        ));
        assert_eq!(store.exec_session("sess1").unwrap(), config.id);
        assert_eq!(store.container_exec_sessions(&config.id).unwrap(), vec!["sess1"]);

        assert!(store.remove(&config).unwrap_err().is_busy(), "sessions block removal");

        store.remove_exec_session("sess1").unwrap();
        assert!(store.remove_exec_session("sess1").unwrap_err().is_not_found());

        store.add_exec_session(&session).unwrap();
        store.remove_container_exec_sessions(&config.id).unwrap();
        assert!(store.container_exec_sessions(&config.id).unwrap().is_empty());
        store.remove(&config).unwrap();
    }
}
