//! Table definitions for the state store.
//!
//! Table and column names are an on-disk contract shared with every
//! process opening the same database; change them only with a schema bump.

use rusqlite::Connection;

pub(crate) const SCHEMA_VERSION: i64 = 1;

const TABLES: &[(&str, &str)] = &[
    (
        "DBConfig",
        r#"
        CREATE TABLE IF NOT EXISTS DBConfig(
                Id            INTEGER PRIMARY KEY NOT NULL,
                SchemaVersion INTEGER NOT NULL,
                Os            TEXT    NOT NULL,
                StaticDir     TEXT    NOT NULL,
                TmpDir        TEXT    NOT NULL,
                GraphRoot     TEXT    NOT NULL,
                RunRoot       TEXT    NOT NULL,
                GraphDriver   TEXT    NOT NULL,
                VolumeDir     TEXT    NOT NULL,
                CHECK (Id IN (1))
        );"#,
    ),
    (
        "IDNamespace",
        r#"
        CREATE TABLE IF NOT EXISTS IDNamespace(
                Id TEXT PRIMARY KEY NOT NULL
        );"#,
    ),
    (
        "ContainerConfig",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerConfig(
                Id              TEXT    PRIMARY KEY NOT NULL,
                Name            TEXT    UNIQUE NOT NULL,
                PodID           TEXT,
                Json            TEXT    NOT NULL,
                FOREIGN KEY (Id)    REFERENCES IDNamespace(Id)    DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (Id)    REFERENCES ContainerState(Id) DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (PodID) REFERENCES PodConfig(Id)
        );"#,
    ),
    (
        "ContainerState",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerState(
                Id       TEXT    PRIMARY KEY NOT NULL,
                State    INTEGER NOT NULL,
                ExitCode INTEGER,
                Json     TEXT    NOT NULL,
                FOREIGN KEY (Id) REFERENCES ContainerConfig(Id) DEFERRABLE INITIALLY DEFERRED,
                CHECK (ExitCode BETWEEN 0 AND 255)
        );"#,
    ),
    (
        "ContainerExecSession",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerExecSession(
                Id          TEXT PRIMARY KEY NOT NULL,
                ContainerID TEXT NOT NULL,
                Json        TEXT NOT NULL,
                FOREIGN KEY (ContainerID) REFERENCES ContainerConfig(Id)
        );"#,
    ),
    (
        "ContainerDependency",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerDependency(
                Id           TEXT NOT NULL,
                DependencyID TEXT NOT NULL,
                PRIMARY KEY (Id, DependencyID),
                FOREIGN KEY (Id)           REFERENCES ContainerConfig(Id) DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (DependencyID) REFERENCES ContainerConfig(Id),
                CHECK (Id <> DependencyID)
        );"#,
    ),
    (
        "ContainerVolume",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerVolume(
                ContainerID TEXT NOT NULL,
                VolumeName  TEXT NOT NULL,
                PRIMARY KEY (ContainerID, VolumeName),
                FOREIGN KEY (ContainerID) REFERENCES ContainerConfig(Id) DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (VolumeName)  REFERENCES VolumeConfig(Name)
        );"#,
    ),
    (
        "ContainerExitCode",
        r#"
        CREATE TABLE IF NOT EXISTS ContainerExitCode(
                Id        TEXT    PRIMARY KEY NOT NULL,
                Timestamp INTEGER NOT NULL,
                ExitCode  INTEGER NOT NULL,
                CHECK (ExitCode BETWEEN 0 AND 255)
        );"#,
    ),
    (
        "PodConfig",
        r#"
        CREATE TABLE IF NOT EXISTS PodConfig(
                Id              TEXT    PRIMARY KEY NOT NULL,
                Name            TEXT    UNIQUE NOT NULL,
                Json            TEXT    NOT NULL,
                FOREIGN KEY (Id) REFERENCES IDNamespace(Id) DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (Id) REFERENCES PodState(Id)    DEFERRABLE INITIALLY DEFERRED
        );"#,
    ),
    (
        "PodState",
        r#"
        CREATE TABLE IF NOT EXISTS PodState(
                Id               TEXT PRIMARY KEY NOT NULL,
                InfraContainerId TEXT,
                Json             TEXT NOT NULL,
                FOREIGN KEY (Id)               REFERENCES PodConfig(Id)       DEFERRABLE INITIALLY DEFERRED,
                FOREIGN KEY (InfraContainerId) REFERENCES ContainerConfig(Id) DEFERRABLE INITIALLY DEFERRED
        );"#,
    ),
    (
        "VolumeConfig",
        r#"
        CREATE TABLE IF NOT EXISTS VolumeConfig(
                Name            TEXT    PRIMARY KEY NOT NULL,
                StorageID       TEXT,
                Json            TEXT    NOT NULL,
                FOREIGN KEY (Name) REFERENCES VolumeState(Name) DEFERRABLE INITIALLY DEFERRED
        );"#,
    ),
    (
        "VolumeState",
        r#"
        CREATE TABLE IF NOT EXISTS VolumeState(
                Name TEXT PRIMARY KEY NOT NULL,
                Json TEXT NOT NULL,
                FOREIGN KEY (Name) REFERENCES VolumeConfig(Name) DEFERRABLE INITIALLY DEFERRED
        );"#,
    ),
    (
        "alive",
        r#"
        CREATE TABLE IF NOT EXISTS alive(
                id         INTEGER PRIMARY KEY NOT NULL,
                boot_id    TEXT    NOT NULL,
                started_at INTEGER NOT NULL,
                CHECK (id IN (1))
        );"#,
    ),
];

/// Create every table that does not exist yet, in one transaction.
pub(crate) fn init(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for (name, sql) in TABLES {
        tracing::trace!(table = name, "ensuring table");
        tx.execute_batch(sql)?;
    }
    tx.commit()
}

/// Names of every table, in creation order.
pub(crate) fn table_names() -> impl Iterator<Item = &'static str> {
    TABLES.iter().map(|(name, _)| *name)
}
