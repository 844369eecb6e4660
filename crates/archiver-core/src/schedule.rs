//! Gap scheduling over a tenant's archive timeline.
//!
//! Given the archives already persisted for one tenant and record type, the
//! scheduler computes which days and months are still owed. It is pure: no
//! I/O, no clock reads, so the same inputs always produce the same tasks.
//!
//! # Coverage rules
//!
//! - A day is covered by a day archive for that date, rolled up or not, or by
//!   any month archive containing it.
//! - A month is owed only when no month archive exists for it and every
//!   eligible day in it (on or after the tenant's earliest day) is covered by
//!   a day archive.
//! - Nothing after the tenant's horizon (see [`Tenant::horizon`]) is owed,
//!   and a month is owed only once it ends on or before the day after the
//!   horizon.

use std::collections::BTreeSet;

use chrono::{DateTime, Days, NaiveDate, Utc};

use crate::model::period::days_inclusive;
use crate::model::{Archive, ArchiveType, Period, Tenant};

/// Days and months already present in the timeline.
#[derive(Debug, Default)]
struct Coverage {
    days: BTreeSet<NaiveDate>,
    months: BTreeSet<NaiveDate>,
}

impl Coverage {
    fn from_existing(existing: &[Archive], org_id: i64, archive_type: ArchiveType) -> Self {
        let mut coverage = Self::default();
        for archive in existing
            .iter()
            .filter(|a| a.org_id == org_id && a.archive_type == archive_type)
        {
            match archive.period {
                Period::Day => coverage.days.insert(archive.start_date),
                Period::Month => coverage.months.insert(archive.start_date),
            };
        }
        coverage
    }

    fn day_covered(&self, day: NaiveDate) -> bool {
        self.days.contains(&day) || self.months.contains(&Period::Month.truncate(day))
    }

    fn month_complete(&self, month_start: NaiveDate, earliest: NaiveDate) -> bool {
        let first = month_start.max(earliest);
        let Some(last) = Period::Month.end_of(month_start).pred_opt() else {
            return false;
        };
        days_inclusive(first, last).all(|day| self.days.contains(&day))
    }
}

/// Day tasks owed for `tenant`, ascending by start date.
#[must_use]
pub fn missing_day_archives(
    existing: &[Archive],
    now: DateTime<Utc>,
    tenant: &Tenant,
    archive_type: ArchiveType,
) -> Vec<Archive> {
    let first = tenant.earliest_day();
    let last = tenant.horizon(now);
    if first > last {
        return Vec::new();
    }

    let coverage = Coverage::from_existing(existing, tenant.id, archive_type);
    days_inclusive(first, last)
        .filter(|day| !coverage.day_covered(*day))
        .map(|day| Archive::scheduled(tenant, archive_type, Period::Day, day))
        .collect()
}

/// Month tasks owed for `tenant`, ascending by start date.
///
/// Call this against the timeline as it stands after the day tasks were
/// persisted: a month with outstanding day gaps is not yet owed.
#[must_use]
pub fn missing_month_archives(
    existing: &[Archive],
    now: DateTime<Utc>,
    tenant: &Tenant,
    archive_type: ArchiveType,
) -> Vec<Archive> {
    let earliest = tenant.earliest_day();
    let Some(limit) = tenant.horizon(now).checked_add_days(Days::new(1)) else {
        return Vec::new();
    };

    let coverage = Coverage::from_existing(existing, tenant.id, archive_type);
    let mut tasks = Vec::new();
    let mut month = Period::Month.truncate(earliest);
    loop {
        let end = Period::Month.end_of(month);
        if end > limit || end == month {
            break;
        }
        if !coverage.months.contains(&month) && coverage.month_complete(month, earliest) {
            tasks.push(Archive::scheduled(tenant, archive_type, Period::Month, month));
        }
        month = end;
    }
    tasks
}

/// Day archives in `existing` that fall inside `month`, ascending.
#[must_use]
pub fn dailies_for_month(existing: &[Archive], month: &Archive) -> Vec<Archive> {
    let mut dailies: Vec<Archive> = existing
        .iter()
        .filter(|a| {
            a.period == Period::Day
                && a.org_id == month.org_id
                && a.archive_type == month.archive_type
                && month.contains(a)
        })
        .cloned()
        .collect();
    dailies.sort_by_key(|a| a.start_date);
    dailies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::period::{days_inclusive, midnight_utc};
    use chrono::{Days, Months, TimeZone};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2018, 1, 8, 12, 30, 0).unwrap()
    }

    fn tenant(earliest: DateTime<Utc>) -> Tenant {
        Tenant {
            id: 2,
            name: "Org 2".into(),
            earliest_eligible: earliest,
            anonymize: false,
            retain_after_archive: true,
            active_days: 90,
        }
    }

    fn persisted(tenant: &Tenant, period: Period, start: NaiveDate, id: i64) -> Archive {
        let mut archive = Archive::scheduled(tenant, ArchiveType::Message, period, start);
        archive
            .mark_built(0, 20, "hash".into(), PathBuf::from("/tmp/a"), 0)
            .unwrap();
        archive.mark_persisted(id, Utc::now()).unwrap();
        archive
    }

    #[test]
    fn new_tenant_gets_no_tasks() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 11, 10, 0, 0, 0).unwrap());
        assert!(missing_day_archives(&[], now(), &org, ArchiveType::Message).is_empty());
        assert!(missing_month_archives(&[], now(), &org, ArchiveType::Message).is_empty());
    }

    #[test]
    fn fresh_tenant_owes_every_day_through_horizon() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        let tasks = missing_day_archives(&[], now(), &org, ArchiveType::Message);
        assert_eq!(tasks.len(), 62);
        assert_eq!(tasks[0].start_date, date(2017, 8, 10));
        assert_eq!(tasks[61].start_date, date(2017, 10, 10));
        assert!(tasks.iter().all(|t| t.period == Period::Day));
    }

    #[test]
    fn months_wait_for_their_days() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        assert!(missing_month_archives(&[], now(), &org, ArchiveType::Message).is_empty());

        let days: Vec<Archive> = missing_day_archives(&[], now(), &org, ArchiveType::Message)
            .into_iter()
            .zip(1..)
            .map(|(task, id)| persisted(&org, Period::Day, task.start_date, id))
            .collect();
        let months = missing_month_archives(&days, now(), &org, ArchiveType::Message);
        assert_eq!(months.len(), 2);
        assert_eq!(months[0].start_date, date(2017, 8, 1));
        assert_eq!(months[1].start_date, date(2017, 9, 1));
    }

    #[test]
    fn existing_days_are_skipped() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        let existing = vec![
            persisted(&org, Period::Day, date(2017, 8, 10), 1),
            persisted(&org, Period::Day, date(2017, 9, 21), 2),
        ];
        let tasks = missing_day_archives(&existing, now(), &org, ArchiveType::Message);
        assert_eq!(tasks.len(), 60);
        assert_eq!(tasks[0].start_date, date(2017, 8, 11));
        assert!(!tasks.iter().any(|t| t.start_date == date(2017, 9, 21)));
    }

    #[test]
    fn month_archive_covers_its_days() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        let existing = vec![persisted(&org, Period::Month, date(2017, 9, 1), 1)];
        let tasks = missing_day_archives(&existing, now(), &org, ArchiveType::Message);
        assert_eq!(tasks.len(), 62 - 30);
        assert!(!tasks.iter().any(|t| t.start_date.format("%m").to_string() == "09"));
        assert!(missing_month_archives(&existing, now(), &org, ArchiveType::Message).is_empty());
    }

    #[test]
    fn other_types_do_not_count_as_coverage() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        let existing = vec![persisted(&org, Period::Day, date(2017, 8, 10), 1)];
        let tasks = missing_day_archives(&existing, now(), &org, ArchiveType::Run);
        assert_eq!(tasks.len(), 62);
    }

    #[test]
    fn month_ending_on_horizon_is_owed() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 9, 1, 0, 0, 0).unwrap());
        let now = Utc.with_ymd_and_hms(2017, 10, 1, 6, 0, 0).unwrap();
        let mut org = org;
        org.active_days = 1;

        let days: Vec<Archive> = missing_day_archives(&[], now, &org, ArchiveType::Message)
            .into_iter()
            .zip(1..)
            .map(|(task, id)| persisted(&org, Period::Day, task.start_date, id))
            .collect();
        assert_eq!(days.len(), 30);

        let months = missing_month_archives(&days, now, &org, ArchiveType::Message);
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].start_date, date(2017, 9, 1));
    }

    #[test]
    fn dailies_for_month_selects_contained_days() {
        let org = tenant(Utc.with_ymd_and_hms(2017, 8, 10, 0, 0, 0).unwrap());
        let existing = vec![
            persisted(&org, Period::Day, date(2017, 8, 31), 2),
            persisted(&org, Period::Day, date(2017, 8, 30), 1),
            persisted(&org, Period::Day, date(2017, 9, 1), 3),
        ];
        let month = Archive::scheduled(&org, ArchiveType::Message, Period::Month, date(2017, 8, 1));
        let dailies = dailies_for_month(&existing, &month);
        assert_eq!(dailies.len(), 2);
        assert_eq!(dailies[0].start_date, date(2017, 8, 30));
    }

    proptest! {
        #[test]
        fn day_tasks_fill_only_the_gaps(
            earliest_offset in 0_u64..400,
            present in proptest::collection::btree_set(0_u64..400, 0..60),
            active_days in 1_u32..120,
        ) {
            let base = date(2017, 1, 1);
            let mut org = tenant(midnight_utc(base.checked_add_days(Days::new(earliest_offset)).unwrap()));
            org.active_days = active_days;
            let existing: Vec<Archive> = present
                .iter()
                .filter(|offset| **offset >= earliest_offset)
                .zip(1..)
                .map(|(offset, id)| persisted(&org, Period::Day, base.checked_add_days(Days::new(*offset)).unwrap(), id))
                .collect();

            let tasks = missing_day_archives(&existing, now(), &org, ArchiveType::Message);
            let horizon = org.horizon(now());
            let taken: BTreeSet<NaiveDate> = existing.iter().map(|a| a.start_date).collect();

            for pair in tasks.windows(2) {
                prop_assert!(pair[0].start_date < pair[1].start_date);
            }
            for task in &tasks {
                prop_assert!(!taken.contains(&task.start_date));
                prop_assert!(task.start_date >= org.earliest_day());
                prop_assert!(task.start_date <= horizon);
            }
            let eligible = if org.earliest_day() > horizon {
                0
            } else {
                days_inclusive(org.earliest_day(), horizon).count()
            };
            let taken_eligible = taken.iter().filter(|d| **d <= horizon).count();
            prop_assert_eq!(tasks.len(), eligible - taken_eligible);
        }

        #[test]
        fn month_tasks_need_complete_uncovered_months(
            earliest_offset in 0_u64..400,
            missing in proptest::collection::btree_set(0_u64..400, 0..20),
            archived_months in proptest::collection::btree_set(0_u32..13, 0..5),
            active_days in 1_u32..120,
        ) {
            let base = date(2017, 1, 1);
            let earliest = base.checked_add_days(Days::new(earliest_offset)).unwrap();
            let mut org = tenant(midnight_utc(earliest));
            org.active_days = active_days;
            let horizon = org.horizon(now());
            let gaps: BTreeSet<NaiveDate> = missing
                .iter()
                .map(|offset| base.checked_add_days(Days::new(*offset)).unwrap())
                .collect();
            let month_starts: BTreeSet<NaiveDate> = archived_months
                .iter()
                .map(|k| base.checked_add_months(Months::new(*k)).unwrap())
                .collect();

            let mut existing: Vec<Archive> = Vec::new();
            if earliest <= horizon {
                existing.extend(
                    days_inclusive(earliest, horizon)
                        .filter(|day| !gaps.contains(day))
                        .map(|day| persisted(&org, Period::Day, day, 0)),
                );
            }
            existing.extend(
                month_starts
                    .iter()
                    .map(|start| persisted(&org, Period::Month, *start, 0)),
            );
            for (archive, id) in existing.iter_mut().zip(1..) {
                archive.id = Some(id);
            }

            let tasks = missing_month_archives(&existing, now(), &org, ArchiveType::Message);
            let limit = horizon.checked_add_days(Days::new(1)).unwrap();

            for pair in tasks.windows(2) {
                prop_assert!(pair[0].end_date() <= pair[1].start_date);
            }
            for task in &tasks {
                prop_assert_eq!(task.period, Period::Month);
                prop_assert!(Period::Month.is_aligned(task.start_date));
                prop_assert!(!month_starts.contains(&task.start_date));
                prop_assert!(task.end_date() <= limit);
                let first = task.start_date.max(earliest);
                let last = task.end_date().pred_opt().unwrap();
                prop_assert!(days_inclusive(first, last).all(|day| !gaps.contains(&day)));
            }

            let mut owed = Vec::new();
            let mut month = Period::Month.truncate(earliest);
            while Period::Month.end_of(month) <= limit {
                let end = Period::Month.end_of(month);
                let last = end.pred_opt().unwrap();
                if !month_starts.contains(&month)
                    && days_inclusive(month.max(earliest), last).all(|day| !gaps.contains(&day))
                {
                    owed.push(month);
                }
                month = end;
            }
            let scheduled: Vec<NaiveDate> = tasks.iter().map(|t| t.start_date).collect();
            prop_assert_eq!(scheduled, owed);
        }
    }
}
