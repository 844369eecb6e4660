//! The archive entity and its lifecycle state machine.
//!
//! ```text
//! Scheduled ──build──▶ Built ──persist──▶ Persisted ──consolidate──▶ RolledUp ──purge──▶ Purged
//!                                              │ (month archives)                       ▲
//!                                              └──────────────────purge─────────────────┘
//! ```
//!
//! The state is derived from the archive's fields rather than stored, so it
//! cannot drift from them. Every mutation goes through a transition method
//! that checks the edge is allowed before touching any field.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::period::{Period, TimeRange};
use super::tenant::Tenant;
use crate::error::{ArchiveError, ErrorCode};

/// Kind of record an archive holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveType {
    Message,
    Run,
}

impl ArchiveType {
    pub const ALL: [Self; 2] = [Self::Message, Self::Run];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Run => "run",
        }
    }
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "message" | "messages" | "msg" => Ok(Self::Message),
            "run" | "runs" => Ok(Self::Run),
            other => Err(format!("unknown archive type '{other}': expected message or run")),
        }
    }
}

/// Lifecycle position of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveState {
    Scheduled,
    Built,
    Persisted,
    RolledUp,
    Purged,
}

impl ArchiveState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Built => "built",
            Self::Persisted => "persisted",
            Self::RolledUp => "rolled_up",
            Self::Purged => "purged",
        }
    }
}

impl fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One artifact covering a single period for one tenant and record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Archive {
    pub id: Option<i64>,
    pub org_id: i64,
    pub archive_type: ArchiveType,
    pub period: Period,
    pub start_date: NaiveDate,
    pub record_count: u64,
    /// Compressed artifact size in bytes.
    pub size: u64,
    /// Hex digest of the uncompressed JSONL bytes.
    pub hash: String,
    pub url: String,
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
    pub needs_deletion: bool,
    pub is_purged: bool,
    pub rollup_id: Option<i64>,
    pub build_time_ms: u64,
    pub created_at: Option<DateTime<Utc>>,
}

impl Archive {
    /// A scheduled task for `tenant`: period and type only, nothing built.
    #[must_use]
    pub fn scheduled(
        tenant: &Tenant,
        archive_type: ArchiveType,
        period: Period,
        start_date: NaiveDate,
    ) -> Self {
        Self {
            id: None,
            org_id: tenant.id,
            archive_type,
            period,
            start_date,
            record_count: 0,
            size: 0,
            hash: String::new(),
            url: String::new(),
            local_path: None,
            needs_deletion: tenant.needs_deletion(),
            is_purged: false,
            rollup_id: None,
            build_time_ms: 0,
            created_at: None,
        }
    }

    #[must_use]
    pub fn end_date(&self) -> NaiveDate {
        self.period.end_of(self.start_date)
    }

    #[must_use]
    pub fn time_range(&self) -> TimeRange {
        TimeRange::from_dates(self.start_date, self.end_date())
    }

    /// Whether this archive's period fully contains `other`'s period.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        self.start_date <= other.start_date && other.end_date() <= self.end_date()
    }

    #[must_use]
    pub fn state(&self) -> ArchiveState {
        if self.is_purged {
            ArchiveState::Purged
        } else if self.rollup_id.is_some() {
            ArchiveState::RolledUp
        } else if self.id.is_some() {
            ArchiveState::Persisted
        } else if !self.hash.is_empty() {
            ArchiveState::Built
        } else {
            ArchiveState::Scheduled
        }
    }

    /// Check that moving from the current state to `next` is allowed.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorCode::InvalidStateTransition`] consistency error
    /// when the edge is not part of the lifecycle, or when its guard fails.
    pub fn check_transition(&self, next: ArchiveState) -> Result<(), ArchiveError> {
        let current = self.state();
        let allowed = match (current, next) {
            (ArchiveState::Scheduled, ArchiveState::Built)
            | (ArchiveState::Built, ArchiveState::Persisted) => true,
            (ArchiveState::Persisted, ArchiveState::RolledUp) => self.period == Period::Day,
            (ArchiveState::Persisted, ArchiveState::Purged) => self.period == Period::Month,
            (ArchiveState::RolledUp, ArchiveState::Purged) => true,
            _ => false,
        };

        if !allowed {
            return Err(ArchiveError::consistency(
                ErrorCode::InvalidStateTransition,
                self,
                format!("cannot move {} archive from {current} to {next}", self.period),
            ));
        }

        if next == ArchiveState::Purged && self.url.is_empty() {
            return Err(ArchiveError::consistency(
                ErrorCode::InvalidStateTransition,
                self,
                "cannot purge before the artifact is uploaded",
            ));
        }

        Ok(())
    }

    /// Record the outcome of a completed build.
    ///
    /// # Errors
    ///
    /// Fails unless the archive is still scheduled, or if `hash` is empty.
    pub fn mark_built(
        &mut self,
        record_count: u64,
        size: u64,
        hash: String,
        local_path: PathBuf,
        build_time_ms: u64,
    ) -> Result<(), ArchiveError> {
        self.check_transition(ArchiveState::Built)?;
        if hash.is_empty() {
            return Err(ArchiveError::consistency(
                ErrorCode::InvalidStateTransition,
                self,
                "built archive must carry a content hash",
            ));
        }
        self.record_count = record_count;
        self.size = size;
        self.hash = hash;
        self.local_path = Some(local_path);
        self.build_time_ms = build_time_ms;
        Ok(())
    }

    /// Attach the object-storage URL of the uploaded artifact.
    ///
    /// # Errors
    ///
    /// Fails unless the archive is built and not yet persisted.
    pub fn mark_uploaded(&mut self, url: String) -> Result<(), ArchiveError> {
        if self.state() != ArchiveState::Built {
            return Err(ArchiveError::consistency(
                ErrorCode::InvalidStateTransition,
                self,
                format!("cannot upload an archive in state {}", self.state()),
            ));
        }
        self.url = url;
        Ok(())
    }

    /// Record the identifier assigned by the metadata store.
    ///
    /// # Errors
    ///
    /// Fails unless the archive is built.
    pub fn mark_persisted(&mut self, id: i64, created_at: DateTime<Utc>) -> Result<(), ArchiveError> {
        self.check_transition(ArchiveState::Persisted)?;
        self.id = Some(id);
        self.created_at = Some(created_at);
        Ok(())
    }

    /// Link this day archive to the month archive that supersedes it.
    ///
    /// # Errors
    ///
    /// Fails unless this is a persisted, unlinked day archive and `month` is
    /// a persisted month archive of the same tenant and type whose period
    /// contains this day.
    pub fn link_rollup(&mut self, month: &Self) -> Result<(), ArchiveError> {
        self.check_transition(ArchiveState::RolledUp)?;
        let Some(month_id) = month.id else {
            return Err(ArchiveError::consistency(
                ErrorCode::RollupMismatch,
                self,
                format!("rollup target {month} is not persisted"),
            ));
        };
        if month.period != Period::Month
            || month.org_id != self.org_id
            || month.archive_type != self.archive_type
            || !month.contains(self)
        {
            return Err(ArchiveError::consistency(
                ErrorCode::RollupMismatch,
                self,
                format!("{month} does not contain this day"),
            ));
        }
        self.rollup_id = Some(month_id);
        Ok(())
    }

    /// Mark source records for this period as deleted.
    ///
    /// # Errors
    ///
    /// Fails unless the archive is uploaded and persisted and, for a day
    /// archive, already rolled up.
    pub fn mark_purged(&mut self) -> Result<(), ArchiveError> {
        self.check_transition(ArchiveState::Purged)?;
        self.is_purged = true;
        Ok(())
    }

    /// Forget the local build file once it has been removed.
    pub fn clear_local_path(&mut self) {
        self.local_path = None;
    }

    /// Deterministic object-storage key; re-runs overwrite rather than duplicate.
    #[must_use]
    pub fn object_key(&self) -> String {
        let prefix = format!(
            "{}/{}/{}/{:04}/{:02}",
            self.org_id,
            self.archive_type,
            self.period,
            self.start_date.year(),
            self.start_date.month()
        );
        match self.period {
            Period::Day => format!("{prefix}/{:02}.jsonl.gz", self.start_date.day()),
            Period::Month => format!("{prefix}.jsonl.gz"),
        }
    }

    /// File name prefix for the local build file; unique per task before the
    /// random suffix is appended.
    #[must_use]
    pub fn temp_prefix(&self) -> String {
        format!(
            "{}_{}_{}_{}_",
            self.org_id,
            self.archive_type,
            self.period,
            self.start_date.format("%Y%m%d")
        )
    }
}

impl fmt::Display for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "org {} {} {} {}",
            self.org_id, self.archive_type, self.period, self.start_date
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tenant() -> Tenant {
        Tenant {
            id: 3,
            name: "Org 3".to_string(),
            earliest_eligible: Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap(),
            anonymize: true,
            retain_after_archive: false,
            active_days: 90,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn persisted(period: Period, start: NaiveDate, id: i64) -> Archive {
        let mut archive = Archive::scheduled(&tenant(), ArchiveType::Message, period, start);
        archive
            .mark_built(1, 42, "abc".into(), PathBuf::from("/tmp/x.jsonl.gz"), 3)
            .unwrap();
        archive.mark_uploaded("file:///x".into()).unwrap();
        archive.mark_persisted(id, Utc::now()).unwrap();
        archive
    }

    #[test]
    fn scheduled_task_has_no_build_outputs() {
        let task = Archive::scheduled(&tenant(), ArchiveType::Run, Period::Day, date(2017, 8, 10));
        assert_eq!(task.state(), ArchiveState::Scheduled);
        assert_eq!(task.size, 0);
        assert!(task.hash.is_empty());
        assert!(task.needs_deletion);
        assert_eq!(task.end_date(), date(2017, 8, 11));
    }

    #[test]
    fn full_day_lifecycle() {
        let month = persisted(Period::Month, date(2017, 8, 1), 10);
        let mut day = persisted(Period::Day, date(2017, 8, 15), 4);
        assert_eq!(day.state(), ArchiveState::Persisted);

        day.link_rollup(&month).unwrap();
        assert_eq!(day.state(), ArchiveState::RolledUp);
        assert_eq!(day.rollup_id, Some(10));

        day.mark_purged().unwrap();
        assert_eq!(day.state(), ArchiveState::Purged);
    }

    #[test]
    fn day_cannot_be_purged_before_rollup() {
        let mut day = persisted(Period::Day, date(2017, 8, 15), 4);
        let err = day.mark_purged().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
        assert!(!day.is_purged);
    }

    #[test]
    fn month_can_be_purged_once_persisted() {
        let mut month = persisted(Period::Month, date(2017, 8, 1), 10);
        month.mark_purged().unwrap();
        assert!(month.is_purged);
    }

    #[test]
    fn rollup_link_is_immutable() {
        let august = persisted(Period::Month, date(2017, 8, 1), 10);
        let mut day = persisted(Period::Day, date(2017, 8, 15), 4);
        day.link_rollup(&august).unwrap();
        let err = day.link_rollup(&august).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[test]
    fn rollup_must_contain_day() {
        let september = persisted(Period::Month, date(2017, 9, 1), 11);
        let mut day = persisted(Period::Day, date(2017, 8, 15), 4);
        let err = day.link_rollup(&september).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RollupMismatch);
        assert_eq!(day.rollup_id, None);
    }

    #[test]
    fn unbuilt_archive_cannot_persist() {
        let mut task =
            Archive::scheduled(&tenant(), ArchiveType::Message, Period::Day, date(2017, 8, 10));
        assert!(task.mark_persisted(1, Utc::now()).is_err());
        assert!(task.mark_uploaded("file:///x".into()).is_err());
    }

    #[test]
    fn object_keys_are_deterministic() {
        let day = Archive::scheduled(&tenant(), ArchiveType::Message, Period::Day, date(2017, 8, 10));
        assert_eq!(day.object_key(), "3/message/day/2017/08/10.jsonl.gz");

        let month = Archive::scheduled(&tenant(), ArchiveType::Run, Period::Month, date(2017, 9, 1));
        assert_eq!(month.object_key(), "3/run/month/2017/09.jsonl.gz");
    }

    #[test]
    fn archive_type_parses_aliases() {
        assert_eq!("messages".parse::<ArchiveType>(), Ok(ArchiveType::Message));
        assert_eq!("Run".parse::<ArchiveType>(), Ok(ArchiveType::Run));
        assert!("flows".parse::<ArchiveType>().is_err());
    }
}
