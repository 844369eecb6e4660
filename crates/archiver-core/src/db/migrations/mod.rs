//! SQLite schema migrations for the archive metadata store.

use super::schema;
use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

const MIGRATIONS: &[(u32, &str)] = &[(1, schema::MIGRATION_V1_SQL), (2, schema::MIGRATION_V2_SQL)];

/// Read `PRAGMA user_version` and convert it to a Rust `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the version value cannot be
/// represented as `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own
/// transaction together with the version bump.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE archiver_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::{LATEST_SCHEMA_VERSION, current_schema_version, migrate};
    use crate::db::schema;
    use rusqlite::{Connection, params};

    fn sqlite_object_exists(
        conn: &Connection,
        object_type: &str,
        object_name: &str,
    ) -> rusqlite::Result<bool> {
        conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM sqlite_master
                WHERE type = ?1 AND name = ?2
            )",
            params![object_type, object_name],
            |row| row.get(0),
        )
    }

    fn insert_day(conn: &Connection, start: &str) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO archives (org_id, archive_type, period, start_date, hash, url, created_at_us)
             VALUES (1, 'message', 'day', ?1, 'h', 'file:///x', 0)",
            [start],
        )?;
        Ok(conn.last_insert_rowid())
    }

    #[test]
    fn migrate_empty_db_to_latest() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        let applied = migrate(&mut conn)?;
        assert_eq!(applied, LATEST_SCHEMA_VERSION);
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);

        assert!(sqlite_object_exists(&conn, "table", "archives")?);
        assert!(sqlite_object_exists(&conn, "table", "archiver_meta")?);

        for index in schema::REQUIRED_INDEXES {
            assert!(
                sqlite_object_exists(&conn, "index", index)?,
                "missing expected index {index}"
            );
        }
        for trigger in schema::REQUIRED_TRIGGERS {
            assert!(
                sqlite_object_exists(&conn, "trigger", trigger)?,
                "missing expected trigger {trigger}"
            );
        }

        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let meta_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM archiver_meta", [], |row| row.get(0))?;
        assert_eq!(meta_rows, 1);

        let schema_version: i64 = conn.query_row(
            "SELECT schema_version FROM archiver_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(schema_version, i64::from(LATEST_SCHEMA_VERSION));

        Ok(())
    }

    #[test]
    fn migrate_upgrades_from_v1_keeping_rows() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch(schema::MIGRATION_V1_SQL)?;
        conn.pragma_update(None, "user_version", 1_i64)?;
        insert_day(&conn, "2017-08-10")?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM archives", [], |row| row.get(0))?;
        assert_eq!(rows, 1);
        Ok(())
    }

    #[test]
    fn natural_key_is_unique() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        insert_day(&conn, "2017-08-10")?;
        assert!(insert_day(&conn, "2017-08-10").is_err());
        Ok(())
    }

    #[test]
    fn month_rows_must_start_on_the_first() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        let result = conn.execute(
            "INSERT INTO archives (org_id, archive_type, period, start_date, hash, created_at_us)
             VALUES (1, 'message', 'month', '2017-08-02', 'h', 0)",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn guards_reject_unrolled_day_purge_and_relinking() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;
        let day = insert_day(&conn, "2017-08-10")?;

        assert!(
            conn.execute("UPDATE archives SET is_purged = 1 WHERE id = ?1", [day])
                .is_err()
        );

        conn.execute(
            "INSERT INTO archives (org_id, archive_type, period, start_date, hash, url, created_at_us)
             VALUES (1, 'message', 'month', '2017-08-01', 'h', 'file:///m', 0)",
            [],
        )?;
        let month = conn.last_insert_rowid();
        conn.execute(
            "UPDATE archives SET rollup_id = ?1 WHERE id = ?2",
            params![month, day],
        )?;
        conn.execute("UPDATE archives SET is_purged = 1 WHERE id = ?1", [day])?;

        conn.execute(
            "INSERT INTO archives (org_id, archive_type, period, start_date, hash, url, created_at_us)
             VALUES (1, 'message', 'month', '2017-09-01', 'h', 'file:///n', 0)",
            [],
        )?;
        let other = conn.last_insert_rowid();
        assert!(
            conn.execute(
                "UPDATE archives SET rollup_id = ?1 WHERE id = ?2",
                params![other, day],
            )
            .is_err()
        );
        Ok(())
    }
}
