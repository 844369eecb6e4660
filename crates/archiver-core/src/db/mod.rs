//! SQLite archive metadata store.
//!
//! Runtime settings:
//! - `journal_mode = WAL` so `list`/`plan` can read while a run writes
//! - `busy_timeout = 5s` to absorb short lock waits between workers
//! - `foreign_keys = ON` so rollup links always name an existing month row

pub mod migrations;
pub mod query;
pub mod rollup;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::{path::Path, time::Duration};

/// Busy timeout used for metadata connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the metadata database, apply runtime pragmas, and
/// migrate the schema to the latest version.
///
/// # Errors
///
/// Returns an error if opening/configuring/migrating the database fails.
pub fn open_metadata(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create metadata db directory {}", parent.display()))?;
    }

    let mut conn = Connection::open(path)
        .with_context(|| format!("open metadata database {}", path.display()))?;

    configure_connection(&conn).context("configure sqlite pragmas")?;
    migrations::migrate(&mut conn).context("apply metadata migrations")?;

    Ok(conn)
}

/// Apply the runtime pragmas shared by every metadata and record connection.
///
/// # Errors
///
/// Returns an error if any pragma cannot be applied.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Record the completion time of a run in `archiver_meta`.
///
/// # Errors
///
/// Returns an error if the update fails.
pub fn touch_last_run(conn: &Connection, at_us: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE archiver_meta SET last_run_at_us = ?1 WHERE id = 1",
        [at_us],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUSY_TIMEOUT, open_metadata, touch_last_run};
    use crate::db::migrations;
    use tempfile::TempDir;

    fn temp_db_path() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("state/archiver.sqlite3");
        (dir, path)
    }

    #[test]
    fn open_metadata_sets_wal_busy_timeout_and_fk() {
        let (_dir, path) = temp_db_path();
        let conn = open_metadata(&path).expect("open metadata db");

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(
            u128::from(busy_timeout_ms),
            DEFAULT_BUSY_TIMEOUT.as_millis()
        );

        let foreign_keys: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .expect("query foreign_keys");
        assert_eq!(foreign_keys, 1);
    }

    #[test]
    fn open_metadata_runs_migrations_and_reopens() {
        let (_dir, path) = temp_db_path();
        {
            let conn = open_metadata(&path).expect("open metadata db");
            touch_last_run(&conn, 42).expect("touch");
        }
        let conn = open_metadata(&path).expect("reopen metadata db");

        let version = migrations::current_schema_version(&conn).expect("schema version query");
        assert_eq!(version, migrations::LATEST_SCHEMA_VERSION);

        let last_run: i64 = conn
            .query_row(
                "SELECT last_run_at_us FROM archiver_meta WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .expect("archiver_meta row");
        assert_eq!(last_run, 42);
    }
}
