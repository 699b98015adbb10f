//! Local datetime handling for SQM readings.
//!
//! Photometer files record local wall-clock time without an offset, so every
//! timestamp in this workspace is a [`PrimitiveDateTime`]. A "night" is the
//! noon-to-noon window keyed by the date on which it starts; see [`night_of`].

use std::fmt;

use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::{format_description, time};
use time::{Date, Duration, Month, PrimitiveDateTime, Time, UtcOffset};

use crate::error::{ParseError, ParseResult};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Accepted datetime layouts, tried in order.
const DATETIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]"),
];

const NOON: Time = time!(12:00);

/// Parse a local datetime as written in data files.
///
/// Both `2024-01-01 20:15:00` and `2024-01-01T20:15:00.000` are accepted.
pub fn parse_datetime(s: &str) -> ParseResult<PrimitiveDateTime> {
    let trimmed = s.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|format| PrimitiveDateTime::parse(trimmed, format).ok())
        .ok_or_else(|| ParseError::InvalidDatetime(s.to_string()))
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> ParseResult<Date> {
    Date::parse(s.trim(), DATE_FORMAT).map_err(|_| ParseError::InvalidDate(s.to_string()))
}

/// Parse a loosely specified query bound.
///
/// `YYYY-MM` means noon on the first of the month, `YYYY-MM-DD` means noon on
/// that day, anything else must be a full datetime.
pub fn parse_query_datetime(s: &str) -> ParseResult<PrimitiveDateTime> {
    let trimmed = s.trim();
    if let Ok(date) = Date::parse(trimmed, DATE_FORMAT) {
        return Ok(date.with_time(NOON));
    }
    if trimmed.len() == 7 {
        if let Ok(date) = Date::parse(&format!("{trimmed}-01"), DATE_FORMAT) {
            return Ok(date.with_time(NOON));
        }
    }
    parse_datetime(trimmed)
}

/// Format a datetime as `YYYY-MM-DD HH:MM:SS`.
///
/// A non-zero fraction of a second is kept so the result parses back to the
/// same instant.
pub fn format_datetime(dt: PrimitiveDateTime) -> String {
    let mut out = format!(
        "{} {:02}:{:02}:{:02}",
        format_date(dt.date()),
        dt.hour(),
        dt.minute(),
        dt.second()
    );
    if dt.nanosecond() != 0 {
        let fraction = format!("{:09}", dt.nanosecond());
        out.push('.');
        out.push_str(fraction.trim_end_matches('0'));
    }
    out
}

/// Format a date as `YYYY-MM-DD`.
pub fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// The night a reading belongs to: the local date of `dt - 12h`.
pub fn night_of(dt: PrimitiveDateTime) -> Date {
    dt.checked_sub(Duration::hours(12)).unwrap_or(dt).date()
}

/// Every night touched by the inclusive span `[start, end]`.
pub fn nights_in_range(start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<Date> {
    let mut nights = Vec::new();
    let last = night_of(end);
    let mut current = night_of(start);
    while current <= last {
        nights.push(current);
        match current.next_day() {
            Some(next) => current = next,
            None => break,
        }
    }
    nights
}

/// A calendar month, used to index files whose names carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    pub year: i32,
    pub month: Month,
}

impl YearMonth {
    /// Build from a numeric month, rejecting anything outside `1..=12`.
    pub fn new(year: i32, month: u8) -> Option<Self> {
        Month::try_from(month).ok().map(|month| Self { year, month })
    }

    /// The month containing `date`.
    pub fn of(date: Date) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The following month.
    #[must_use]
    pub fn next(self) -> Self {
        match self.month {
            Month::December => Self {
                year: self.year + 1,
                month: Month::January,
            },
            month => Self {
                year: self.year,
                month: month.next(),
            },
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, u8::from(self.month))
    }
}

/// Every month touched by the inclusive span `[start, end]`.
pub fn months_in_range(start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<YearMonth> {
    let mut months = Vec::new();
    let last = YearMonth::of(end.date());
    let mut current = YearMonth::of(start.date());
    while current <= last {
        months.push(current);
        current = current.next();
    }
    months
}

/// Parse a fixed UTC offset: `UTC`, `GMT`, `Z`, `+HH:MM`, `-HHMM` or `+HH`.
pub fn parse_utc_offset(s: &str) -> ParseResult<UtcOffset> {
    let trimmed = s.trim();
    let err = || ParseError::InvalidOffset(s.to_string());
    let upper = trimmed.to_ascii_uppercase();
    if matches!(upper.as_str(), "UTC" | "GMT" | "Z") {
        return Ok(UtcOffset::UTC);
    }
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    let (sign, digits) = match rest.chars().next() {
        Some('+') => (1i8, &rest[1..]),
        Some('-') => (-1i8, &rest[1..]),
        _ => return Err(err()),
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(err());
    }
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i8>().map_err(|_| err())?, 0),
        3 | 4 => {
            let split = digits.len() - 2;
            (
                digits[..split].parse::<i8>().map_err(|_| err())?,
                digits[split..].parse::<i8>().map_err(|_| err())?,
            )
        }
        _ => return Err(err()),
    };
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| err())
}

/// Serde adapter writing a [`PrimitiveDateTime`] as `YYYY-MM-DD HH:MM:SS`.
pub mod as_datetime {
    use super::*;

    pub fn serialize<S: serde::Serializer>(
        dt: &PrimitiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        format_datetime(*dt).serialize(serializer)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<PrimitiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_datetime(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter writing a sequence of datetimes as strings.
pub mod as_datetime_seq {
    use super::*;

    pub fn serialize<S: serde::Serializer>(
        values: &[PrimitiveDateTime],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|dt| format_datetime(*dt)))
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<PrimitiveDateTime>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|s| parse_datetime(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Serde adapter writing a [`Date`] as `YYYY-MM-DD`.
pub mod as_date {
    use super::*;

    pub fn serialize<S: serde::Serializer>(date: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        format_date(*date).serialize(serializer)
    }

    pub fn deserialize<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_date(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    #[test]
    fn test_parse_datetime_layouts() {
        let expected = datetime!(2024-01-01 20:15:00);
        assert_eq!(parse_datetime("2024-01-01 20:15:00").unwrap(), expected);
        assert_eq!(parse_datetime("2024-01-01T20:15:00").unwrap(), expected);
        assert_eq!(parse_datetime(" 2024-01-01T20:15:00.000 ").unwrap(), expected);
        assert_eq!(parse_datetime("2024-01-01 20:15").unwrap(), expected);
        assert!(parse_datetime("20:15:00").is_err());
    }

    #[test]
    fn test_format_roundtrip() {
        let dt = datetime!(2024-03-09 04:05:06);
        assert_eq!(format_datetime(dt), "2024-03-09 04:05:06");
        assert_eq!(parse_datetime(&format_datetime(dt)).unwrap(), dt);
        assert_eq!(format_date(date!(2024 - 03 - 09)), "2024-03-09");
    }

    #[test]
    fn test_night_of() {
        assert_eq!(night_of(datetime!(2024-01-01 22:00)), date!(2024 - 01 - 01));
        assert_eq!(night_of(datetime!(2024-01-02 02:00)), date!(2024 - 01 - 01));
        assert_eq!(night_of(datetime!(2024-01-02 11:59:59)), date!(2024 - 01 - 01));
        assert_eq!(night_of(datetime!(2024-01-02 12:00)), date!(2024 - 01 - 02));
    }

    #[test]
    fn test_query_datetime() {
        assert_eq!(
            parse_query_datetime("2024-02").unwrap(),
            datetime!(2024-02-01 12:00)
        );
        assert_eq!(
            parse_query_datetime("2024-02-10").unwrap(),
            datetime!(2024-02-10 12:00)
        );
        assert_eq!(
            parse_query_datetime("2024-02-10 03:00:00").unwrap(),
            datetime!(2024-02-10 03:00)
        );
    }

    #[test]
    fn test_months_in_range_crosses_year() {
        let months = months_in_range(datetime!(2023-11-15 00:00), datetime!(2024-02-01 00:00));
        let labels: Vec<String> = months.iter().map(ToString::to_string).collect();
        assert_eq!(labels, ["2023-11", "2023-12", "2024-01", "2024-02"]);
    }

    #[test]
    fn test_nights_in_range() {
        let nights = nights_in_range(datetime!(2024-01-01 20:00), datetime!(2024-01-03 04:00));
        assert_eq!(nights, vec![date!(2024 - 01 - 01), date!(2024 - 01 - 02)]);
    }

    #[test]
    fn test_parse_utc_offset() {
        assert_eq!(parse_utc_offset("UTC").unwrap(), UtcOffset::UTC);
        assert_eq!(parse_utc_offset("+05:30").unwrap(), offset!(+5:30));
        assert_eq!(parse_utc_offset("-0700").unwrap(), offset!(-7));
        assert_eq!(parse_utc_offset("UTC-3").unwrap(), offset!(-3));
        assert!(parse_utc_offset("America/Denver").is_err());
    }

    #[test]
    fn test_year_month_rejects_invalid_month() {
        assert!(YearMonth::new(2024, 13).is_none());
        assert!(YearMonth::new(2024, 0).is_none());
        assert_eq!(YearMonth::new(2024, 12).unwrap().next().to_string(), "2025-01");
    }
}
