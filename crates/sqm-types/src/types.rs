//! Core value types for SQM readings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{Date, PrimitiveDateTime, UtcOffset};

use crate::datetime::{self, night_of};
use crate::error::{ParseError, ParseResult};

/// Readings exactly as they appear in a source file: datetime string to value string.
///
/// Diffing between file versions compares these strings, never parsed values,
/// so `19.40` and `19.4` are different readings.
pub type RawReadings = BTreeMap<String, String>;

/// `(datetime, value)` string pairs leaving the dataset.
///
/// Unlike [`RawReadings`] this may hold several values for one datetime, as
/// when two files disagree about the same moment and both go away.
pub type RemovedReadings = BTreeSet<(String, String)>;

/// Open map of named attribute values attached to a reading or a nightly record.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A single photometer reading in local time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Local wall-clock time of the measurement.
    #[serde(with = "crate::datetime::as_datetime")]
    pub datetime: PrimitiveDateTime,
    /// Sky brightness in magnitudes per square arcsecond.
    pub value: f64,
}

impl Reading {
    /// Create a new reading.
    pub fn new(datetime: PrimitiveDateTime, value: f64) -> Self {
        Self { datetime, value }
    }

    /// Parse a reading from the strings stored in [`RawReadings`].
    ///
    /// Non-finite values are rejected.
    pub fn from_raw(datetime: &str, value: &str) -> ParseResult<Self> {
        let datetime = datetime::parse_datetime(datetime)?;
        let parsed: f64 = value
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidValue(value.to_string()))?;
        if !parsed.is_finite() {
            return Err(ParseError::InvalidValue(value.to_string()));
        }
        Ok(Self::new(datetime, parsed))
    }

    /// The night this reading belongs to.
    #[must_use]
    pub fn night(&self) -> Date {
        night_of(self.datetime)
    }

    /// Key under which the dataset treats two readings as the same point.
    ///
    /// `19.5` and `19.50` share a key; readings at different moments never do.
    pub fn identity(&self) -> (PrimitiveDateTime, u64) {
        (self.datetime, self.value.to_bits())
    }
}

/// A reading together with the attributes computed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedReading {
    #[serde(with = "crate::datetime::as_datetime")]
    pub datetime: PrimitiveDateTime,
    pub value: f64,
    pub attributes: Attributes,
}

/// Readings that appeared and disappeared between two reconciliations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadingDiff {
    pub added: RawReadings,
    pub removed: RemovedReadings,
}

impl ReadingDiff {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Earliest and latest readings known for a station.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingsRange {
    pub earliest: Option<Reading>,
    pub latest: Option<Reading>,
}

/// The brightest reading of one night with its attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestNightlyRecord {
    /// The night, keyed by the date on which it starts.
    #[serde(with = "crate::datetime::as_date")]
    pub date: Date,
    #[serde(with = "crate::datetime::as_datetime")]
    pub datetime: PrimitiveDateTime,
    pub value: f64,
    pub attributes: Attributes,
}

/// Descriptive information about a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub elevation: Option<f64>,
    /// Offset between local file time and UTC, when known.
    #[serde(default)]
    pub utc_offset: Option<UtcOffset>,
}

impl StationInfo {
    /// A station known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latitude: None,
            longitude: None,
            elevation: None,
            utc_offset: None,
        }
    }

    /// Returns true if both latitude and longitude are known.
    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// Which twilight bounds a night.
///
/// Each variant names the darkness that must be reached: `Civil` runs from
/// sunset to sunrise, `Night` from the end of astronomical twilight to its
/// beginning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TwilightType {
    Civil,
    #[default]
    Nautical,
    Astronomical,
    Night,
}

impl TwilightType {
    /// Depression of the sun below the horizon, in degrees, at which the night starts.
    pub fn sun_depression(self) -> f64 {
        match self {
            TwilightType::Civil => 0.833,
            TwilightType::Nautical => 6.0,
            TwilightType::Astronomical => 12.0,
            TwilightType::Night => 18.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TwilightType::Civil => "civil",
            TwilightType::Nautical => "nautical",
            TwilightType::Astronomical => "astronomical",
            TwilightType::Night => "night",
        }
    }
}

impl fmt::Display for TwilightType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwilightType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "civil" => Ok(TwilightType::Civil),
            "nautical" => Ok(TwilightType::Nautical),
            "astronomical" => Ok(TwilightType::Astronomical),
            "night" => Ok(TwilightType::Night),
            _ => Err(ParseError::InvalidTwilight(s.to_string())),
        }
    }
}

/// The dark part of one night in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightWindow {
    #[serde(with = "crate::datetime::as_datetime")]
    pub sunset: PrimitiveDateTime,
    #[serde(with = "crate::datetime::as_datetime")]
    pub sunrise: PrimitiveDateTime,
}

impl NightWindow {
    /// Returns true if `dt` lies within `[sunset, sunrise]`.
    pub fn contains(&self, dt: PrimitiveDateTime) -> bool {
        self.sunset <= dt && dt <= self.sunrise
    }
}

/// Position of the sun, in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SunPosition {
    pub altitude: f64,
    pub azimuth: f64,
}

/// Position of the moon, angles in radians and distance in kilometres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoonPosition {
    pub altitude: f64,
    pub azimuth: f64,
    pub distance: f64,
}

/// Illuminated part of the moon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoonIllumination {
    /// Illuminated fraction, 0.0 (new) to 1.0 (full).
    pub fraction: f64,
    /// Phase, 0.0 new, 0.5 full, back to 1.0.
    pub phase: f64,
    pub angle: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_reading_from_raw() {
        let reading = Reading::from_raw("2024-01-01 20:15:00", "19.44").unwrap();
        assert_eq!(reading.datetime, datetime!(2024-01-01 20:15:00));
        assert_eq!(reading.value, 19.44);
        assert_eq!(reading.night(), date!(2024 - 01 - 01));
    }

    #[test]
    fn test_reading_from_raw_rejects_bad_values() {
        assert!(Reading::from_raw("2024-01-01 20:15:00", "abc").is_err());
        assert!(Reading::from_raw("2024-01-01 20:15:00", "NaN").is_err());
        assert!(Reading::from_raw("2024-01-01 20:15:00", "inf").is_err());
        assert!(Reading::from_raw("not a date", "19.0").is_err());
    }

    #[test]
    fn test_reading_identity_ignores_formatting() {
        let short = Reading::from_raw("2024-01-01 20:15:00", "19.5").unwrap();
        let long = Reading::from_raw("2024-01-01 20:15:00", "19.50").unwrap();
        let other = Reading::from_raw("2024-01-01 20:16:00", "19.5").unwrap();
        assert_eq!(short.identity(), long.identity());
        assert_ne!(short.identity(), other.identity());
    }

    #[test]
    fn test_twilight_parse() {
        assert_eq!("Nautical".parse::<TwilightType>().unwrap(), TwilightType::Nautical);
        assert_eq!("night".parse::<TwilightType>().unwrap(), TwilightType::Night);
        assert!("dusk".parse::<TwilightType>().is_err());
        assert_eq!(TwilightType::default(), TwilightType::Nautical);
    }

    #[test]
    fn test_twilight_serde() {
        let json = serde_json::to_string(&TwilightType::Astronomical).unwrap();
        assert_eq!(json, "\"astronomical\"");
    }

    #[test]
    fn test_reading_serializes_plain_datetime() {
        let reading = Reading::new(datetime!(2024-01-02 02:00), 21.2);
        let json = serde_json::to_value(reading).unwrap();
        assert_eq!(json["datetime"], "2024-01-02 02:00:00");
        let back: Reading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_night_window_contains_bounds() {
        let window = NightWindow {
            sunset: datetime!(2024-01-01 19:00),
            sunrise: datetime!(2024-01-02 05:00),
        };
        assert!(window.contains(datetime!(2024-01-01 19:00)));
        assert!(window.contains(datetime!(2024-01-02 05:00)));
        assert!(!window.contains(datetime!(2024-01-02 05:00:01)));
    }

    #[test]
    fn test_reading_diff_is_empty() {
        let mut diff = ReadingDiff::default();
        assert!(diff.is_empty());
        diff.removed
            .insert(("2024-01-01 20:00:00".into(), "19.0".into()));
        assert!(!diff.is_empty());
    }
}
