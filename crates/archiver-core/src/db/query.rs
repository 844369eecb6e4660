//! Read-side queries over the `archives` table.
//!
//! Every function takes a shared `&Connection` and returns typed
//! [`Archive`] values, never raw rows. Rows that fail to decode surface as
//! [`ErrorCode::CorruptMetadata`](crate::error::ErrorCode::CorruptMetadata).

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, types::Type};

use crate::error::ArchiveError;
use crate::model::{Archive, ArchiveType, Period};

pub(crate) const ARCHIVE_COLUMNS: &str = "id, org_id, archive_type, period, start_date, \
     record_count, size, hash, url, needs_deletion, is_purged, rollup_id, \
     build_time_ms, created_at_us";

/// Every archive for one tenant and type, any state, ordered by start date
/// then granularity (day before month).
///
/// # Errors
///
/// Returns an error if the query fails or a row cannot be decoded.
pub fn current_archives(
    conn: &Connection,
    org_id: i64,
    archive_type: ArchiveType,
) -> Result<Vec<Archive>, ArchiveError> {
    let sql = format!(
        "SELECT {ARCHIVE_COLUMNS} FROM archives \
         WHERE org_id = ?1 AND archive_type = ?2 \
         ORDER BY start_date ASC, period ASC, id ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![org_id, archive_type.as_str()], archive_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Look up an archive by id, e.g. to follow a day's rollup link.
///
/// # Errors
///
/// Returns an error if the query fails or the row cannot be decoded.
pub fn get_archive(conn: &Connection, id: i64) -> Result<Option<Archive>, ArchiveError> {
    let sql = format!("SELECT {ARCHIVE_COLUMNS} FROM archives WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [id], archive_from_row)
        .optional()?)
}

/// Look up an archive by its natural key.
///
/// # Errors
///
/// Returns an error if the query fails or the row cannot be decoded.
pub fn find_archive(
    conn: &Connection,
    org_id: i64,
    archive_type: ArchiveType,
    period: Period,
    start_date: NaiveDate,
) -> Result<Option<Archive>, ArchiveError> {
    let sql = format!(
        "SELECT {ARCHIVE_COLUMNS} FROM archives \
         WHERE org_id = ?1 AND archive_type = ?2 AND period = ?3 AND start_date = ?4"
    );
    Ok(conn
        .query_row(
            &sql,
            params![
                org_id,
                archive_type.as_str(),
                period.as_str(),
                format_date(start_date)
            ],
            archive_from_row,
        )
        .optional()?)
}

/// Month archives whose source records still need deleting.
///
/// # Errors
///
/// Returns an error if the query fails or a row cannot be decoded.
pub fn pending_purges(
    conn: &Connection,
    org_id: i64,
    archive_type: ArchiveType,
) -> Result<Vec<Archive>, ArchiveError> {
    let sql = format!(
        "SELECT {ARCHIVE_COLUMNS} FROM archives \
         WHERE org_id = ?1 AND archive_type = ?2 AND period = 'month' \
           AND needs_deletion = 1 AND is_purged = 0 \
         ORDER BY start_date ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![org_id, archive_type.as_str()], archive_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Day archives linked to the month archive `month_id`, ascending.
///
/// # Errors
///
/// Returns an error if the query fails or a row cannot be decoded.
pub fn rollup_members(conn: &Connection, month_id: i64) -> Result<Vec<Archive>, ArchiveError> {
    let sql = format!(
        "SELECT {ARCHIVE_COLUMNS} FROM archives \
         WHERE rollup_id = ?1 ORDER BY start_date ASC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([month_id], archive_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn conversion_error(idx: usize, ty: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, message.into())
}

fn unsigned(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

/// Decode one row selected with [`ARCHIVE_COLUMNS`].
///
/// # Errors
///
/// Returns a conversion error when an enum, date, or counter column holds a
/// value the model cannot represent.
pub fn archive_from_row(row: &Row<'_>) -> rusqlite::Result<Archive> {
    let archive_type: String = row.get(2)?;
    let period: String = row.get(3)?;
    let start_date: String = row.get(4)?;
    let created_at_us: i64 = row.get(13)?;

    Ok(Archive {
        id: Some(row.get(0)?),
        org_id: row.get(1)?,
        archive_type: archive_type
            .parse()
            .map_err(|e| conversion_error(2, Type::Text, e))?,
        period: period
            .parse()
            .map_err(|e| conversion_error(3, Type::Text, e))?,
        start_date: NaiveDate::parse_from_str(&start_date, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?,
        record_count: unsigned(row, 5)?,
        size: unsigned(row, 6)?,
        hash: row.get(7)?,
        url: row.get(8)?,
        local_path: None,
        needs_deletion: row.get(9)?,
        is_purged: row.get(10)?,
        rollup_id: row.get(11)?,
        build_time_ms: unsigned(row, 12)?,
        created_at: Some(
            DateTime::<Utc>::from_timestamp_micros(created_at_us).ok_or_else(|| {
                conversion_error(13, Type::Integer, format!("timestamp {created_at_us} out of range"))
            })?,
        ),
    })
}
