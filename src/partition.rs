//! Mapping between timestamps and storage partitions
//!
//! The configured partition interval only selects a band: anything up to a day
//! partitions by calendar day, up to a week by ISO week, and anything longer by
//! calendar month. Existing on-disk layouts depend on these three formats, so
//! the interval is deliberately not honoured as an exact period.
//!
//! All key formats are zero-padded and most-significant-first, so comparing
//! keys as strings orders them chronologically.

use std::fmt;
use std::time::Duration;
use time::{Date, Month, OffsetDateTime, Weekday};

use crate::error::StorageError;

const DAY: Duration = Duration::from_secs(24 * 3600);
const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn from_interval(interval: Duration) -> Self {
        if interval <= DAY {
            Granularity::Day
        } else if interval <= WEEK {
            Granularity::Week
        } else {
            Granularity::Month
        }
    }
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeRange {
    /// Latest instant still inside the range
    pub fn last_instant(&self) -> OffsetDateTime {
        self.end - time::Duration::NANOSECOND
    }

    /// Whether the range overlaps the inclusive bounds `[from, to]`.
    /// A missing bound is unbounded on that side.
    pub fn intersects(&self, from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> bool {
        from.map_or(true, |from| self.end > from) && to.map_or(true, |to| self.start <= to)
    }
}

/// Identifier of one storage partition, e.g. `2024-03-15`, `2024-W11` or `2024-03`.
///
/// Ordering is by key text, which is chronological within one granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    name: String,
    granularity: Granularity,
    start: Date,
}

impl PartitionKey {
    fn day(date: Date) -> Self {
        Self {
            name: format!(
                "{:04}-{:02}-{:02}",
                date.year(),
                date.month() as u8,
                date.day()
            ),
            granularity: Granularity::Day,
            start: date,
        }
    }

    fn week(date: Date) -> Self {
        let (year, week, _) = date.to_iso_week_date();
        let monday =
            date - time::Duration::days(i64::from(date.weekday().number_days_from_monday()));
        Self {
            name: format!("{:04}-W{:02}", year, week),
            granularity: Granularity::Week,
            start: monday,
        }
    }

    fn month(date: Date) -> Self {
        let first = date - time::Duration::days(i64::from(date.day()) - 1);
        Self {
            name: format!("{:04}-{:02}", date.year(), date.month() as u8),
            granularity: Granularity::Month,
            start: first,
        }
    }

    /// Parse a partition directory name back into a key.
    ///
    /// Only the exact canonical spellings produced by [`partition_for`] are
    /// accepted.
    pub fn parse(name: &str) -> Result<Self, StorageError> {
        let invalid = || StorageError::InvalidPartition(name.to_string());
        let number = |part: &str, width: usize| -> Option<i32> {
            if part.len() == width && part.chars().all(|c| c.is_ascii_digit()) {
                part.parse().ok()
            } else {
                None
            }
        };

        let parts: Vec<&str> = name.split('-').collect();
        let key = match parts.as_slice() {
            [year, month, day] => {
                let year = number(year, 4).ok_or_else(invalid)?;
                let month = month_of(number(month, 2).ok_or_else(invalid)?).ok_or_else(invalid)?;
                let day = number(day, 2).ok_or_else(invalid)?;
                let date = Date::from_calendar_date(year, month, day as u8).map_err(|_| invalid())?;
                Self::day(date)
            }
            [year, week] if week.starts_with('W') => {
                let year = number(year, 4).ok_or_else(invalid)?;
                let week = number(&week[1..], 2).ok_or_else(invalid)?;
                let date = Date::from_iso_week_date(year, week as u8, Weekday::Monday)
                    .map_err(|_| invalid())?;
                Self::week(date)
            }
            [year, month] => {
                let year = number(year, 4).ok_or_else(invalid)?;
                let month = month_of(number(month, 2).ok_or_else(invalid)?).ok_or_else(invalid)?;
                let date = Date::from_calendar_date(year, month, 1).map_err(|_| invalid())?;
                Self::month(date)
            }
            _ => return Err(invalid()),
        };

        if key.name != name {
            return Err(invalid());
        }
        Ok(key)
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The `[start, end)` range this partition covers, in UTC
    pub fn range(&self) -> TimeRange {
        let end = match self.granularity {
            Granularity::Day => self.start + time::Duration::days(1),
            Granularity::Week => self.start + time::Duration::weeks(1),
            Granularity::Month => {
                let days = self.start.month().length(self.start.year());
                self.start + time::Duration::days(i64::from(days))
            }
        };
        TimeRange {
            start: self.start.midnight().assume_utc(),
            end: end.midnight().assume_utc(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn month_of(number: i32) -> Option<Month> {
    u8::try_from(number).ok().and_then(|n| Month::try_from(n).ok())
}

/// Partition a timestamp belongs to for the configured interval
pub fn partition_for(timestamp: OffsetDateTime, interval: Duration) -> PartitionKey {
    let date = timestamp.to_offset(time::UtcOffset::UTC).date();
    match Granularity::from_interval(interval) {
        Granularity::Day => PartitionKey::day(date),
        Granularity::Week => PartitionKey::week(date),
        Granularity::Month => PartitionKey::month(date),
    }
}

pub fn range_of(key: &PartitionKey) -> TimeRange {
    key.range()
}

pub fn current_partition(interval: Duration) -> PartitionKey {
    partition_for(OffsetDateTime::now_utc(), interval)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn covers(range: TimeRange, t: OffsetDateTime) -> bool {
        range.start <= t && t < range.end
    }

    #[test]
    fn test_granularity_bands() {
        assert_eq!(Granularity::from_interval(HOUR), Granularity::Day);
        assert_eq!(Granularity::from_interval(DAY), Granularity::Day);
        assert_eq!(Granularity::from_interval(DAY + HOUR), Granularity::Week);
        assert_eq!(Granularity::from_interval(WEEK), Granularity::Week);
        assert_eq!(Granularity::from_interval(WEEK + HOUR), Granularity::Month);
    }

    #[test]
    fn test_key_formats() {
        // 2024-03-15 12:00:00 UTC, a Friday in ISO week 11
        let t = ts(1_710_504_000);
        assert_eq!(partition_for(t, DAY).as_str(), "2024-03-15");
        assert_eq!(partition_for(t, WEEK).as_str(), "2024-W11");
        assert_eq!(partition_for(t, 30 * DAY).as_str(), "2024-03");
    }

    #[test]
    fn test_iso_week_year_boundary() {
        // 2024-12-30 is Monday of ISO week 1 of 2025
        let t = ts(1_735_560_000);
        let key = partition_for(t, WEEK);
        assert_eq!(key.as_str(), "2025-W01");
        let range = key.range();
        assert!(covers(range, t));
        assert_eq!(range.start, ts(1_735_516_800));
    }

    #[test]
    fn test_range_contains_timestamp() {
        let intervals = [HOUR, DAY, 3 * DAY, WEEK, 30 * DAY];
        // Sweep across a leap year, month ends and week boundaries
        let mut t = ts(1_704_067_200 - 3 * 86_400);
        let end = ts(1_704_067_200 + 400 * 86_400);
        while t < end {
            for interval in intervals {
                let key = partition_for(t, interval);
                assert_eq!(key, partition_for(t, interval));
                assert!(covers(range_of(&key), t), "{} does not contain {}", key, t);
            }
            t += time::Duration::hours(7);
        }
    }

    #[test]
    fn test_key_ordering_is_chronological() {
        for interval in [DAY, WEEK, 30 * DAY] {
            let mut previous = partition_for(ts(1_672_531_200), interval);
            let mut t = ts(1_672_531_200);
            for _ in 0..800 {
                t += time::Duration::hours(13);
                let key = partition_for(t, interval);
                assert!(previous.as_str() <= key.as_str(), "{} > {}", previous, key);
                previous = key;
            }
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for name in ["2024-03-15", "2024-W11", "2024-03", "2024-02-29", "2020-W53"] {
            let key = PartitionKey::parse(name).unwrap();
            assert_eq!(key.as_str(), name);
        }
    }

    #[test]
    fn test_month_range() {
        let key = PartitionKey::parse("2024-02").unwrap();
        let range = key.range();
        assert_eq!(range.start, ts(1_706_745_600)); // 2024-02-01
        assert_eq!(range.end, ts(1_709_251_200)); // 2024-03-01
        assert_eq!(range.last_instant(), ts(1_709_251_200) - time::Duration::NANOSECOND);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for name in [
            "lost+found",
            "2024-13",
            "2024-3",
            "2023-02-29",
            "2024-W54",
            "2021-W53",
            "24-03-15",
            "2024-03-15-01",
            "devices.json",
            "",
        ] {
            assert!(PartitionKey::parse(name).is_err(), "{} should not parse", name);
        }
    }

    #[test]
    fn test_intersects() {
        let range = PartitionKey::parse("2024-03-15").unwrap().range();
        assert!(range.intersects(None, None));
        assert!(range.intersects(Some(range.start), Some(range.start)));
        assert!(!range.intersects(Some(range.end), None));
        assert!(!range.intersects(None, Some(range.start - time::Duration::NANOSECOND)));
        assert!(range.intersects(Some(range.last_instant()), None));
    }
}
