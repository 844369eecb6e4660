//! Calendar period arithmetic.
//!
//! All periods are UTC. A period start is a [`NaiveDate`] interpreted as
//! midnight UTC; the end is exclusive.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Granularity of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Day,
    Month,
}

impl Period {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    /// Truncate a date to the start of the period containing it.
    #[must_use]
    pub fn truncate(self, date: NaiveDate) -> NaiveDate {
        match self {
            Self::Day => date,
            Self::Month => date.with_day(1).unwrap_or(date),
        }
    }

    /// Whether `date` is a valid start for this period.
    #[must_use]
    pub fn is_aligned(self, date: NaiveDate) -> bool {
        self.truncate(date) == date
    }

    /// Exclusive end of the period starting at `start`.
    #[must_use]
    pub fn end_of(self, start: NaiveDate) -> NaiveDate {
        let end = match self {
            Self::Day => start.checked_add_days(Days::new(1)),
            Self::Month => start.checked_add_months(Months::new(1)),
        };
        end.unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" | "D" => Ok(Self::Day),
            "month" | "M" => Ok(Self::Month),
            other => Err(format!("unknown period '{other}': expected day or month")),
        }
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    #[must_use]
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: midnight_utc(start),
            end: midnight_utc(end),
        }
    }

    #[must_use]
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Start as microseconds since the Unix epoch.
    #[must_use]
    pub fn start_us(&self) -> i64 {
        self.start.timestamp_micros()
    }

    /// End as microseconds since the Unix epoch.
    #[must_use]
    pub fn end_us(&self) -> i64 {
        self.end.timestamp_micros()
    }
}

#[must_use]
pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Iterate calendar days in `[first, last]`.
pub fn days_inclusive(first: NaiveDate, last: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    first
        .iter_days()
        .take_while(move |day| *day <= last)
}
