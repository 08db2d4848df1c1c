//! Transactional state store.
//!
//! Every entity keeps its configuration and its state as two JSON blobs
//! keyed by ID (volumes by name), with names indexed for lookup. Adding an
//! entity writes both blobs in one transaction; an entity with a config
//! record but no state record is corrupt.
//!
//! One [`Database`] handle is shared by the per-entity stores:
//! [`ContainerStore`], [`PodStore`] and [`VolumeStore`].

mod containers;
mod exec;
mod pods;
pub(crate) mod schema;
mod volumes;

pub use containers::ContainerStore;
pub use exec::ExecSession;
pub use pods::PodStore;
pub use volumes::VolumeStore;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use podlite_shared::errors::{PodliteError, PodliteResult};
use rusqlite::types::FromSql;
use rusqlite::{Connection, OptionalExtension, params};

use crate::container::state::ContainerState;
use crate::pod::PodState;
use crate::runtime::options::RuntimeOptions;
use crate::util::clean_path;
use crate::volume::config::{VolumeConfig, VolumeState};

/// Map a rusqlite result into a database error.
macro_rules! db_err {
    ($expr:expr) => {
        $expr.map_err(|e| podlite_shared::errors::PodliteError::Database(e.to_string()))
    };
}
pub(crate) use db_err;

/// Serialize a record into its JSON blob.
pub(crate) fn to_json<T: serde::Serialize>(value: &T, what: &str) -> PodliteResult<String> {
    serde_json::to_string(value)
        .map_err(|e| PodliteError::Database(format!("Failed to serialize {}: {}", what, e)))
}

/// Deserialize a record from its JSON blob.
pub(crate) fn from_json<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> PodliteResult<T> {
    serde_json::from_str(json)
        .map_err(|e| PodliteError::Database(format!("Failed to deserialize {}: {}", what, e)))
}

/// LIKE pattern matching IDs that start with `prefix`.
pub(crate) fn like_prefix(prefix: &str) -> String {
    let escaped = prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}%", escaped)
}

/// Resolve a full ID, a unique ID prefix, or a name in `table`.
///
/// An exact ID wins outright, then an exact name. Otherwise the input must
/// be the start of exactly one ID.
pub(crate) fn lookup_entity_id<T: FromSql>(
    conn: &Connection,
    table: &str,
    what: &str,
    id_or_name: &str,
) -> PodliteResult<T> {
    if id_or_name.is_empty() {
        return Err(PodliteError::InvalidArgument(format!(
            "must provide a non-empty {} name or ID",
            what
        )));
    }

    for column in ["Id", "Name"] {
        let exact: Option<T> = db_err!(
            conn.query_row(
                &format!("SELECT Id FROM {} WHERE {} = ?1", table, column),
                params![id_or_name],
                |row| row.get(0),
            )
            .optional()
        )?;
        if let Some(id) = exact {
            return Ok(id);
        }
    }

    let mut stmt = db_err!(conn.prepare(&format!(
        "SELECT Id FROM {} WHERE Id LIKE ?1 ESCAPE '\\'",
        table
    )))?;
    let rows = db_err!(stmt.query_map(params![like_prefix(id_or_name)], |row| {
        row.get::<_, T>(0)
    }))?;
    let mut matches = db_err!(rows.collect::<Result<Vec<T>, _>>())?;

    if matches.len() > 1 {
        return Err(PodliteError::InvalidArgument(format!(
            "more than one result for {} name or ID {} ({} matches)",
            what,
            id_or_name,
            matches.len()
        )));
    }
    matches.pop().ok_or_else(|| {
        PodliteError::NotFound(format!("no {} with name or ID {} found", what, id_or_name))
    })
}

/// Shared handle to the SQLite connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> PodliteResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PodliteError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut conn = db_err!(Connection::open(path))?;
        db_err!(conn.busy_timeout(Duration::from_secs(100)))?;
        let _mode: String = db_err!(conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0)))?;
        db_err!(conn.pragma_update(None, "foreign_keys", "ON"))?;
        db_err!(conn.pragma_update(None, "synchronous", "FULL"))?;
        db_err!(schema::init(&mut conn))?;

        tracing::debug!(path = %path.display(), "opened state database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // ========================================================================
    // DB configuration
    // ========================================================================

    /// The paths recorded when the database was first used, if any.
    pub fn db_config(&self) -> PodliteResult<Option<DbConfig>> {
        let conn = self.conn();
        db_err!(
            conn.query_row(
                "SELECT Os, StaticDir, TmpDir, GraphRoot, RunRoot, GraphDriver, VolumeDir FROM DBConfig",
                [],
                |row| {
                    Ok(DbConfig {
                        os: row.get(0)?,
                        static_dir: row.get(1)?,
                        tmp_dir: row.get(2)?,
                        graph_root: row.get(3)?,
                        run_root: row.get(4)?,
                        graph_driver: row.get(5)?,
                        volume_dir: row.get(6)?,
                    })
                },
            )
            .optional()
        )
    }

    /// Record `ours` on first use; afterwards any difference is fatal.
    pub fn validate_db_config(&self, ours: &DbConfig) -> PodliteResult<()> {
        let stored = match self.db_config()? {
            Some(stored) => stored,
            None => {
                let mut conn = self.conn();
                let tx = db_err!(conn.transaction())?;
                db_err!(tx.execute(
                    "INSERT INTO DBConfig VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        1,
                        schema::SCHEMA_VERSION,
                        ours.os,
                        ours.static_dir,
                        ours.tmp_dir,
                        ours.graph_root,
                        ours.run_root,
                        ours.graph_driver,
                        ours.volume_dir
                    ],
                ))?;
                db_err!(tx.commit())?;
                return Ok(());
            }
        };

        let fields = [
            ("OS", &stored.os, &ours.os),
            ("static dir", &stored.static_dir, &ours.static_dir),
            ("tmp dir", &stored.tmp_dir, &ours.tmp_dir),
            ("graph root", &stored.graph_root, &ours.graph_root),
            ("run root", &stored.run_root, &ours.run_root),
            ("graph driver", &stored.graph_driver, &ours.graph_driver),
            ("volume path", &stored.volume_dir, &ours.volume_dir),
        ];
        for (field, db_val, our_val) in fields {
            if db_val != our_val {
                return Err(PodliteError::DbBadConfig(format!(
                    "database {} {:?} does not match our {} {:?}",
                    field, db_val, field, our_val
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Refresh after reboot
    // ========================================================================

    /// Reset every state record and drop per-boot records.
    ///
    /// Runs as one transaction: either every state is reset and the exit
    /// code and exec session tables are emptied, or nothing changes.
    pub fn refresh(&self) -> PodliteResult<()> {
        let mut conn = self.conn();
        let tx = db_err!(conn.transaction())?;

        let ctr_states: Vec<(String, String)> = {
            let mut stmt = db_err!(tx.prepare("SELECT Id, Json FROM ContainerState"))?;
            let rows = db_err!(stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))))?;
            db_err!(rows.collect::<Result<_, _>>())?
        };
        for (id, json) in ctr_states {
            let mut state: ContainerState = from_json(&json, "container state")?;
            state.reset_for_refresh();
            db_err!(tx.execute(
                "UPDATE ContainerState SET State = ?1, Json = ?2 WHERE Id = ?3",
                params![state.status.as_i32(), to_json(&state, "container state")?, id],
            ))?;
        }

        let pod_states: Vec<(String, String)> = {
            let mut stmt = db_err!(tx.prepare("SELECT Id, Json FROM PodState"))?;
            let rows = db_err!(stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?))))?;
            db_err!(rows.collect::<Result<_, _>>())?
        };
        for (id, json) in pod_states {
            let mut state: PodState = from_json(&json, "pod state")?;
            state.reset_for_refresh();
            db_err!(tx.execute(
                "UPDATE PodState SET Json = ?1 WHERE Id = ?2",
                params![to_json(&state, "pod state")?, id],
            ))?;
        }

        let vol_states: Vec<(String, String, String)> = {
            let mut stmt = db_err!(tx.prepare(
                "SELECT VolumeState.Name, VolumeConfig.Json, VolumeState.Json \
                 FROM VolumeState INNER JOIN VolumeConfig ON VolumeState.Name = VolumeConfig.Name"
            ))?;
            let rows = db_err!(stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?))))?;
            db_err!(rows.collect::<Result<_, _>>())?
        };
        for (name, config_json, state_json) in vol_states {
            let config: VolumeConfig = from_json(&config_json, "volume config")?;
            let mut state: VolumeState = from_json(&state_json, "volume state")?;
            state.reset_for_refresh(config.uses_driver());
            db_err!(tx.execute(
                "UPDATE VolumeState SET Json = ?1 WHERE Name = ?2",
                params![to_json(&state, "volume state")?, name],
            ))?;
        }

        db_err!(tx.execute("DELETE FROM ContainerExitCode", []))?;
        db_err!(tx.execute("DELETE FROM ContainerExecSession", []))?;

        db_err!(tx.commit())?;
        tracing::info!("refreshed state store after reboot");
        Ok(())
    }

    // ========================================================================
    // Reboot detection via alive table
    // ========================================================================

    /// Record the current boot and report whether it differs from the last one.
    ///
    /// The very first run is not a reboot.
    pub fn check_and_update_boot(&self) -> PodliteResult<bool> {
        self.check_and_update_boot_id(&get_boot_id())
    }

    pub(crate) fn check_and_update_boot_id(&self, current_boot_id: &str) -> PodliteResult<bool> {
        let conn = self.conn();

        let existing: Option<String> = db_err!(
            conn.query_row("SELECT boot_id FROM alive WHERE id = 1", [], |row| row.get(0))
                .optional()
        )?;

        let is_reboot = existing.is_some_and(|stored| stored != current_boot_id);

        db_err!(conn.execute(
            r#"
            INSERT INTO alive (id, boot_id, started_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET boot_id = ?1, started_at = ?2
            "#,
            params![current_boot_id, Utc::now().timestamp()],
        ))?;

        Ok(is_reboot)
    }
}

/// Paths and drivers the database was initialized against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub os: String,
    pub static_dir: String,
    pub tmp_dir: String,
    pub graph_root: String,
    pub run_root: String,
    pub graph_driver: String,
    pub volume_dir: String,
}

impl DbConfig {
    pub fn from_options(options: &RuntimeOptions) -> Self {
        let clean = |p: &Path| clean_path(&p.to_string_lossy());
        Self {
            os: std::env::consts::OS.to_string(),
            static_dir: clean(&options.static_dir),
            tmp_dir: clean(&options.tmp_dir),
            graph_root: clean(&options.graph_root),
            run_root: clean(&options.run_root),
            graph_driver: options.graph_driver.clone(),
            volume_dir: clean(&options.volume_path),
        }
    }
}

/// Get system boot ID (unique per boot).
fn get_boot_id() -> String {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string())
    }

    #[cfg(not(target_os = "linux"))]
    {
        uuid::Uuid::new_v4().to_string()
    }
}
