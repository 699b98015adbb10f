//! Shared types for SQM (Sky Quality Meter) photometer data.
//!
//! This crate holds the value types passed between the cache stores in
//! `sqm-store` and the synchronization engine in `sqm-core`:
//!
//! - [`Reading`] and [`RawReadings`] for parsed and file-level readings
//! - [`ReadingDiff`] for the result of reconciling files against snapshots
//! - [`BestNightlyRecord`] for the per-night rollup
//! - [`StationInfo`] and [`TwilightType`] for station metadata and night bounds
//! - [`datetime`] helpers for the local-time formats found in data files

pub mod datetime;
pub mod error;
pub mod types;

pub use datetime::{
    YearMonth, format_date, format_datetime, months_in_range, night_of, nights_in_range,
    parse_date, parse_datetime, parse_query_datetime, parse_utc_offset,
};
pub use error::{ParseError, ParseResult};
pub use types::{
    AnnotatedReading, Attributes, BestNightlyRecord, MoonIllumination, MoonPosition, NightWindow,
    RawReadings, Reading, ReadingDiff, ReadingsRange, RemovedReadings, StationInfo, SunPosition,
    TwilightType,
};
