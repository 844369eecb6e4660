use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Default number of most recent days left unarchived.
pub const DEFAULT_ACTIVE_DAYS: u32 = 90;

/// An organization whose records are archived independently of all others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    /// First instant the tenant could have generated data. Nothing before the
    /// day containing it is ever scheduled.
    pub earliest_eligible: DateTime<Utc>,
    /// Redact contact-identifying fields before serialization.
    pub anonymize: bool,
    /// Keep source records after archival instead of purging them.
    pub retain_after_archive: bool,
    /// Number of most recent days left in the live store.
    pub active_days: u32,
}

impl Tenant {
    #[must_use]
    pub fn earliest_day(&self) -> NaiveDate {
        self.earliest_eligible.date_naive()
    }

    /// Last day that may be archived at `now`.
    ///
    /// Never later than the day before `now`, so the current day is never
    /// scheduled even with a zero-day active window.
    #[must_use]
    pub fn horizon(&self, now: DateTime<Utc>) -> NaiveDate {
        let back = u64::from(self.active_days.max(1));
        now.date_naive()
            .checked_sub_days(Days::new(back))
            .unwrap_or(NaiveDate::MIN)
    }

    #[must_use]
    pub const fn needs_deletion(&self) -> bool {
        !self.retain_after_archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tenant(active_days: u32) -> Tenant {
        Tenant {
            id: 2,
            name: "Org 2".to_string(),
            earliest_eligible: Utc.with_ymd_and_hms(2017, 8, 10, 14, 0, 0).unwrap(),
            anonymize: false,
            retain_after_archive: true,
            active_days,
        }
    }

    #[test]
    fn horizon_subtracts_active_days() {
        let now = Utc.with_ymd_and_hms(2018, 1, 8, 12, 30, 0).unwrap();
        assert_eq!(
            tenant(90).horizon(now),
            NaiveDate::from_ymd_opt(2017, 10, 10).unwrap()
        );
    }

    #[test]
    fn zero_active_days_still_excludes_today() {
        let now = Utc.with_ymd_and_hms(2018, 1, 8, 0, 0, 0).unwrap();
        assert_eq!(
            tenant(0).horizon(now),
            NaiveDate::from_ymd_opt(2018, 1, 7).unwrap()
        );
    }

    #[test]
    fn earliest_day_truncates_time() {
        assert_eq!(
            tenant(90).earliest_day(),
            NaiveDate::from_ymd_opt(2017, 8, 10).unwrap()
        );
    }
}
