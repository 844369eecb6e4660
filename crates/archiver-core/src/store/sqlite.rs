//! Live tenant data held in SQLite.
//!
//! Implements both [`RecordStore`] and [`TenantDirectory`]. A connection is
//! opened per call so the store itself is `Send + Sync` and every worker
//! thread streams over its own connection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::{debug, info};

use super::{RecordSink, RecordStore, TenantDirectory};
use crate::cancel::CancelToken;
use crate::db::configure_connection;
use crate::error::{ArchiveError, ErrorCode};
use crate::model::record::{
    Attachment, ChannelRef, ContactRef, Direction, FlowRef, MessageRecord, PathStep, RunRecord,
    RunValue,
};
use crate::model::{ArchiveType, Record, Tenant, TimeRange};

/// Schema of the live record database. JSON columns hold arrays/objects in
/// the shapes written to artifacts.
pub const SOURCE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS orgs (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_anon INTEGER NOT NULL DEFAULT 0,
    retain_after_archive INTEGER NOT NULL DEFAULT 1,
    active_days INTEGER,
    created_on_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    id INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    uuid TEXT NOT NULL UNIQUE,
    name TEXT
);

CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS flows (
    id INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS msgs (
    id INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    uuid TEXT NOT NULL,
    contact_id INTEGER NOT NULL REFERENCES contacts(id),
    channel_id INTEGER REFERENCES channels(id),
    urn TEXT,
    direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
    msg_type TEXT NOT NULL,
    status TEXT NOT NULL,
    visibility TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    attachments TEXT NOT NULL DEFAULT '[]',
    labels TEXT NOT NULL DEFAULT '[]',
    created_on_us INTEGER NOT NULL,
    sent_on_us INTEGER,
    modified_on_us INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_msgs_org_created ON msgs(org_id, created_on_us, id);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY,
    org_id INTEGER NOT NULL REFERENCES orgs(id),
    uuid TEXT NOT NULL,
    flow_id INTEGER NOT NULL REFERENCES flows(id),
    contact_id INTEGER NOT NULL REFERENCES contacts(id),
    responded INTEGER NOT NULL DEFAULT 0,
    path TEXT NOT NULL DEFAULT '[]',
    results TEXT NOT NULL DEFAULT '{}',
    events TEXT NOT NULL DEFAULT '[]',
    created_on_us INTEGER NOT NULL,
    modified_on_us INTEGER NOT NULL,
    exited_on_us INTEGER,
    exit_type TEXT,
    submitted_by TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_org_modified ON runs(org_id, modified_on_us, id);
";

const SELECT_MESSAGES: &str = "
SELECT m.id, m.uuid, c.uuid, c.name, m.urn, ch.uuid, ch.name, m.direction, m.msg_type,
       m.status, m.visibility, m.text, m.attachments, m.labels,
       m.created_on_us, m.sent_on_us, m.modified_on_us
FROM msgs m
JOIN contacts c ON c.id = m.contact_id
LEFT JOIN channels ch ON ch.id = m.channel_id
WHERE m.org_id = ?1 AND m.created_on_us >= ?2 AND m.created_on_us < ?3
ORDER BY m.created_on_us ASC, m.id ASC";

const SELECT_RUNS: &str = "
SELECT r.id, r.uuid, f.uuid, f.name, c.uuid, c.name, r.responded, r.path, r.results,
       r.events, r.created_on_us, r.modified_on_us, r.exited_on_us, r.exit_type,
       r.submitted_by
FROM runs r
JOIN flows f ON f.id = r.flow_id
JOIN contacts c ON c.id = r.contact_id
WHERE r.org_id = ?1 AND r.modified_on_us >= ?2 AND r.modified_on_us < ?3
ORDER BY r.modified_on_us ASC, r.id ASC";

/// Create the live record tables if they do not exist.
///
/// # Errors
///
/// Returns an error if the DDL fails.
pub fn init_source_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SOURCE_SCHEMA_SQL)
}

/// [`RecordStore`] and [`TenantDirectory`] over a live SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    path: PathBuf,
    default_active_days: u32,
}

impl SqliteRecordStore {
    /// `default_active_days` applies to orgs without their own setting.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, default_active_days: u32) -> Self {
        Self {
            path: path.into(),
            default_active_days,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the database file and its schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the DDL fails.
    pub fn init(&self) -> Result<(), ArchiveError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        configure_connection(&conn)?;
        init_source_schema(&conn)?;
        info!(path = %self.path.display(), "record store schema ready");
        Ok(())
    }

    fn connect(&self, operation: &'static str) -> Result<Connection, ArchiveError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ArchiveError::transient(ErrorCode::StoreUnavailable, operation, e))?;
        configure_connection(&conn).map_err(|e| store_error(operation, e))?;
        Ok(conn)
    }
}

/// Busy, locked, and I/O failures are worth retrying; anything else is a
/// problem with the data or schema.
fn store_error(operation: &'static str, err: rusqlite::Error) -> ArchiveError {
    use rusqlite::ErrorCode as Sqlite;
    match err.sqlite_error_code() {
        Some(
            Sqlite::DatabaseBusy
            | Sqlite::DatabaseLocked
            | Sqlite::CannotOpen
            | Sqlite::SystemIoFailure
            | Sqlite::DiskFull,
        ) => ArchiveError::transient(ErrorCode::StoreUnavailable, operation, err),
        _ => ArchiveError::Store(format!("{operation}: {err}")),
    }
}

fn timestamp(raw: i64, column: &str) -> Result<DateTime<Utc>, ArchiveError> {
    DateTime::<Utc>::from_timestamp_micros(raw)
        .ok_or_else(|| ArchiveError::Store(format!("{column} timestamp {raw} out of range")))
}

fn optional_timestamp(raw: Option<i64>, column: &str) -> Result<Option<DateTime<Utc>>, ArchiveError> {
    raw.map(|us| timestamp(us, column)).transpose()
}

fn json_column<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T, ArchiveError> {
    serde_json::from_str(raw).map_err(|e| ArchiveError::Store(format!("bad {column} JSON: {e}")))
}

fn message_from_row(row: &Row<'_>) -> Result<MessageRecord, ArchiveError> {
    let direction: String = row.get(7)?;
    let attachments: Vec<String> = json_column(&row.get::<_, String>(12)?, "attachments")?;
    let channel_uuid: Option<String> = row.get(5)?;
    let channel_name: Option<String> = row.get(6)?;

    Ok(MessageRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        contact: ContactRef {
            uuid: row.get(2)?,
            name: row.get(3)?,
        },
        urn: row.get(4)?,
        channel: channel_uuid.map(|uuid| ChannelRef {
            uuid,
            name: channel_name.unwrap_or_default(),
        }),
        direction: match direction.as_str() {
            "in" => Direction::In,
            "out" => Direction::Out,
            other => return Err(ArchiveError::Store(format!("unknown direction '{other}'"))),
        },
        msg_type: row.get(8)?,
        status: row.get(9)?,
        visibility: row.get(10)?,
        text: row.get(11)?,
        attachments: attachments.iter().map(|a| Attachment::parse(a)).collect(),
        labels: json_column(&row.get::<_, String>(13)?, "labels")?,
        created_on: timestamp(row.get(14)?, "created_on")?,
        sent_on: optional_timestamp(row.get(15)?, "sent_on")?,
        modified_on: timestamp(row.get(16)?, "modified_on")?,
    })
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord, ArchiveError> {
    let path: Vec<PathStep> = json_column(&row.get::<_, String>(7)?, "path")?;
    let values: BTreeMap<String, RunValue> = json_column(&row.get::<_, String>(8)?, "results")?;
    let events: Vec<serde_json::Value> = json_column(&row.get::<_, String>(9)?, "events")?;

    Ok(RunRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        flow: FlowRef {
            uuid: row.get(2)?,
            name: row.get(3)?,
        },
        contact: ContactRef {
            uuid: row.get(4)?,
            name: row.get(5)?,
        },
        responded: row.get(6)?,
        path,
        values,
        events,
        created_on: timestamp(row.get(10)?, "created_on")?,
        modified_on: timestamp(row.get(11)?, "modified_on")?,
        exited_on: optional_timestamp(row.get(12)?, "exited_on")?,
        exit_type: row.get(13)?,
        submitted_by: row.get(14)?,
    })
}

impl RecordStore for SqliteRecordStore {
    fn stream_records(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        range: &TimeRange,
        cancel: &CancelToken,
        sink: &mut RecordSink<'_>,
    ) -> Result<u64, ArchiveError> {
        const OP: &str = "stream records";
        let conn = self.connect(OP)?;
        let sql = match archive_type {
            ArchiveType::Message => SELECT_MESSAGES,
            ArchiveType::Run => SELECT_RUNS,
        };
        let mut stmt = conn.prepare(sql).map_err(|e| store_error(OP, e))?;
        let mut rows = stmt
            .query(params![tenant.id, range.start_us(), range.end_us()])
            .map_err(|e| store_error(OP, e))?;

        let mut count = 0_u64;
        while let Some(row) = rows.next().map_err(|e| store_error(OP, e))? {
            cancel.check()?;
            let record = match archive_type {
                ArchiveType::Message => Record::Message(message_from_row(row)?),
                ArchiveType::Run => Record::Run(run_from_row(row)?),
            };
            sink(record)?;
            count += 1;
        }

        debug!(
            org_id = tenant.id,
            archive_type = %archive_type,
            start = %range.start,
            record_count = count,
            "records streamed"
        );
        Ok(count)
    }

    fn delete_records(
        &self,
        tenant: &Tenant,
        archive_type: ArchiveType,
        range: &TimeRange,
    ) -> Result<u64, ArchiveError> {
        const OP: &str = "delete records";
        let conn = self.connect(OP)?;
        let sql = match archive_type {
            ArchiveType::Message => {
                "DELETE FROM msgs WHERE org_id = ?1 AND created_on_us >= ?2 AND created_on_us < ?3"
            }
            ArchiveType::Run => {
                "DELETE FROM runs WHERE org_id = ?1 AND modified_on_us >= ?2 AND modified_on_us < ?3"
            }
        };

        let tx = conn.unchecked_transaction().map_err(|e| store_error(OP, e))?;
        let deleted = tx
            .execute(sql, params![tenant.id, range.start_us(), range.end_us()])
            .map_err(|e| store_error(OP, e))?;
        tx.commit().map_err(|e| store_error(OP, e))?;

        info!(
            org_id = tenant.id,
            archive_type = %archive_type,
            start = %range.start,
            deleted,
            "source records deleted"
        );
        Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
    }
}

impl TenantDirectory for SqliteRecordStore {
    fn list_active_tenants(&self) -> Result<Vec<Tenant>, ArchiveError> {
        const OP: &str = "list tenants";
        let conn = self.connect(OP)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, created_on_us, is_anon, retain_after_archive, active_days
                 FROM orgs WHERE is_active = 1 ORDER BY id ASC",
            )
            .map_err(|e| store_error(OP, e))?;
        let mut rows = stmt.query([]).map_err(|e| store_error(OP, e))?;

        let mut tenants = Vec::new();
        while let Some(row) = rows.next().map_err(|e| store_error(OP, e))? {
            let active_days: Option<i64> = row.get(5)?;
            tenants.push(Tenant {
                id: row.get(0)?,
                name: row.get(1)?,
                earliest_eligible: timestamp(row.get(2)?, "created_on")?,
                anonymize: row.get(3)?,
                retain_after_archive: row.get(4)?,
                active_days: active_days
                    .and_then(|d| u32::try_from(d).ok())
                    .unwrap_or(self.default_active_days),
            });
        }
        Ok(tenants)
    }
}
