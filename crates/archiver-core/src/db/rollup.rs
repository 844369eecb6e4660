//! Transactional archive persistence and day-to-month consolidation.
//!
//! The coordinator is the only writer of the `archives` table. Every write
//! either commits completely or leaves the table untouched; in particular a
//! month row never exists without all of its day links, and vice versa.

use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use super::query::{self, format_date};
use crate::error::{ArchiveError, ErrorCode};
use crate::model::period::days_inclusive;
use crate::model::{Archive, ArchiveState, ArchiveType, Period};

/// Writes archive metadata against one metadata connection.
pub struct RollupCoordinator<'conn> {
    conn: &'conn Connection,
}

impl<'conn> RollupCoordinator<'conn> {
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub const fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Insert a built archive, or adopt the existing row with the same
    /// tenant, type, granularity, and start.
    ///
    /// On success the archive carries the row id and is `Persisted`.
    ///
    /// # Errors
    ///
    /// Rejects unbuilt or misaligned archives with a consistency error;
    /// database failures surface as [`ArchiveError::Database`].
    pub fn persist(&self, archive: &mut Archive) -> Result<i64, ArchiveError> {
        validate_for_insert(archive)?;
        let id = insert_or_existing(self.conn, archive)?;
        let created_at = query::get_archive(self.conn, id)?
            .and_then(|row| row.created_at)
            .unwrap_or_else(Utc::now);
        archive.mark_persisted(id, created_at)?;
        debug!(archive_id = id, archive = %archive, "archive persisted");
        Ok(id)
    }

    /// Insert `month` and link every day in `dailies` to it, atomically.
    ///
    /// `earliest` is the tenant's first eligible day; days before it are not
    /// required. On success the month is `Persisted` and every day is
    /// `RolledUp` in memory as well as in the store.
    ///
    /// # Errors
    ///
    /// Returns a consistency error, and writes nothing, when a day is not
    /// persisted, lies outside the month, is rolled into a different month,
    /// or when the days do not cover every eligible day of the month.
    /// Replaying a committed consolidation adopts the stored month.
    pub fn consolidate(
        &self,
        month: &mut Archive,
        dailies: &mut [Archive],
        earliest: NaiveDate,
    ) -> Result<(), ArchiveError> {
        if month.period != Period::Month {
            return Err(ArchiveError::consistency(
                ErrorCode::RollupMismatch,
                month,
                "rollup target must be a month archive",
            ));
        }
        validate_for_insert(month)?;
        validate_coverage(month, dailies, earliest)?;

        let tx = self.conn.unchecked_transaction()?;
        let month_id = insert_or_existing(&tx, month)?;

        for day in dailies.iter() {
            let Some(day_id) = day.id else {
                continue;
            };
            let updated = tx.execute(
                "UPDATE archives SET rollup_id = ?1
                 WHERE id = ?2 AND (rollup_id IS NULL OR rollup_id = ?1)",
                params![month_id, day_id],
            )?;
            if updated != 1 {
                // dropping `tx` rolls back the month row and earlier links
                return Err(ArchiveError::consistency(
                    ErrorCode::RollupMismatch,
                    day,
                    "day archive is missing or rolled into another month",
                ));
            }
        }
        let created_at = query::get_archive(&tx, month_id)?
            .and_then(|row| row.created_at)
            .unwrap_or_else(Utc::now);
        tx.commit()?;

        month.mark_persisted(month_id, created_at)?;
        for day in dailies.iter_mut() {
            day.link_rollup(month)?;
        }

        info!(
            archive_id = month_id,
            archive = %month,
            days = dailies.len(),
            "month consolidated"
        );
        Ok(())
    }

    /// Record that the source rows for `archive` were deleted.
    ///
    /// # Errors
    ///
    /// Fails unless the archive is persisted, uploaded, and (for days)
    /// rolled up.
    pub fn mark_purged(&self, archive: &mut Archive) -> Result<(), ArchiveError> {
        archive.check_transition(ArchiveState::Purged)?;
        let Some(id) = archive.id else {
            return Err(ArchiveError::consistency(
                ErrorCode::InvalidStateTransition,
                archive,
                "cannot purge an archive that was never persisted",
            ));
        };
        let updated = self
            .conn
            .execute("UPDATE archives SET is_purged = 1 WHERE id = ?1", [id])?;
        if updated != 1 {
            return Err(ArchiveError::consistency(
                ErrorCode::CorruptMetadata,
                archive,
                "archive row disappeared before purge",
            ));
        }
        archive.mark_purged()
    }

    /// Mark a month purged together with every day rolled into it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::mark_purged`]; nothing is written on failure.
    pub fn mark_month_purged(
        &self,
        month: &mut Archive,
        dailies: &mut [Archive],
    ) -> Result<(), ArchiveError> {
        month.check_transition(ArchiveState::Purged)?;
        for day in dailies.iter() {
            if day.rollup_id != month.id {
                return Err(ArchiveError::consistency(
                    ErrorCode::RollupMismatch,
                    day,
                    format!("not rolled into {month}"),
                ));
            }
            if !day.is_purged {
                day.check_transition(ArchiveState::Purged)?;
            }
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE archives SET is_purged = 1 WHERE id = ?1",
            [month.id],
        )?;
        tx.execute(
            "UPDATE archives SET is_purged = 1 WHERE rollup_id = ?1",
            [month.id],
        )?;
        tx.commit()?;

        month.mark_purged()?;
        for day in dailies.iter_mut().filter(|d| !d.is_purged) {
            day.mark_purged()?;
        }
        Ok(())
    }

    /// See [`query::current_archives`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn current_archives(
        &self,
        org_id: i64,
        archive_type: ArchiveType,
    ) -> Result<Vec<Archive>, ArchiveError> {
        query::current_archives(self.conn, org_id, archive_type)
    }

    /// See [`query::get_archive`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get_archive(&self, id: i64) -> Result<Option<Archive>, ArchiveError> {
        query::get_archive(self.conn, id)
    }

    /// See [`query::pending_purges`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn pending_purges(
        &self,
        org_id: i64,
        archive_type: ArchiveType,
    ) -> Result<Vec<Archive>, ArchiveError> {
        query::pending_purges(self.conn, org_id, archive_type)
    }

    /// See [`query::rollup_members`].
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn rollup_members(&self, month_id: i64) -> Result<Vec<Archive>, ArchiveError> {
        query::rollup_members(self.conn, month_id)
    }
}

fn validate_for_insert(archive: &Archive) -> Result<(), ArchiveError> {
    if archive.state() != ArchiveState::Built {
        return Err(ArchiveError::consistency(
            ErrorCode::InvalidStateTransition,
            archive,
            format!("only built archives can be persisted, found {}", archive.state()),
        ));
    }
    if !archive.period.is_aligned(archive.start_date) {
        return Err(ArchiveError::consistency(
            ErrorCode::MisalignedPeriod,
            archive,
            format!("start is not aligned to a {}", archive.period),
        ));
    }
    Ok(())
}

fn validate_coverage(
    month: &Archive,
    dailies: &[Archive],
    earliest: NaiveDate,
) -> Result<(), ArchiveError> {
    for day in dailies {
        if day.period != Period::Day
            || day.org_id != month.org_id
            || day.archive_type != month.archive_type
            || !month.contains(day)
        {
            return Err(ArchiveError::consistency(
                ErrorCode::RollupMismatch,
                day,
                format!("does not belong to {month}"),
            ));
        }
        if day.state() != ArchiveState::Persisted {
            return Err(ArchiveError::consistency(
                ErrorCode::RollupMismatch,
                day,
                format!("expected a persisted, unlinked day, found {}", day.state()),
            ));
        }
    }

    let first = month.start_date.max(earliest);
    let Some(last) = month.end_date().pred_opt() else {
        return Ok(());
    };
    if let Some(missing) =
        days_inclusive(first, last).find(|d| !dailies.iter().any(|a| a.start_date == *d))
    {
        return Err(ArchiveError::consistency(
            ErrorCode::IncompleteMonth,
            month,
            format!("no day archive for {missing}"),
        ));
    }
    Ok(())
}

/// Insert the archive row unless its natural key already exists; return the
/// row id either way.
fn insert_or_existing(conn: &Connection, archive: &Archive) -> Result<i64, ArchiveError> {
    let start = format_date(archive.start_date);
    let inserted = conn.execute(
        "INSERT INTO archives (
            org_id, archive_type, period, start_date, record_count, size, hash, url,
            needs_deletion, is_purged, build_time_ms, created_at_us
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)
        ON CONFLICT (org_id, archive_type, period, start_date) DO NOTHING",
        params![
            archive.org_id,
            archive.archive_type.as_str(),
            archive.period.as_str(),
            start,
            i64::try_from(archive.record_count).unwrap_or(i64::MAX),
            i64::try_from(archive.size).unwrap_or(i64::MAX),
            archive.hash,
            archive.url,
            archive.needs_deletion,
            i64::try_from(archive.build_time_ms).unwrap_or(i64::MAX),
            Utc::now().timestamp_micros(),
        ],
    )?;
    if inserted == 1 {
        return Ok(conn.last_insert_rowid());
    }

    let existing: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, hash FROM archives
             WHERE org_id = ?1 AND archive_type = ?2 AND period = ?3 AND start_date = ?4",
            params![
                archive.org_id,
                archive.archive_type.as_str(),
                archive.period.as_str(),
                start
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((id, hash)) = existing else {
        return Err(ArchiveError::consistency(
            ErrorCode::InternalUnexpected,
            archive,
            "insert was ignored but no conflicting row exists",
        ));
    };
    if hash != archive.hash {
        warn!(
            archive_id = id,
            archive = %archive,
            stored_hash = %hash,
            built_hash = %archive.hash,
            "period already archived with different content; keeping stored row"
        );
    }
    Ok(id)
}
