//! Sun and moon geometry used to bound nights and annotate readings.
//!
//! The engine never computes positions itself; it asks an [`Ephemeris`]. The
//! bundled [`FixedNight`] knows no positions and treats every night as running
//! from 19:00 to 05:00 local time.

use time::macros::time;
use time::{Date, Duration, PrimitiveDateTime, Time};

use sqm_types::{MoonIllumination, MoonPosition, NightWindow, SunPosition, TwilightType};

/// Provider of astronomical geometry for one station.
pub trait Ephemeris {
    /// Sunset on `date` and the following sunrise, bounded by `twilight`.
    fn night_window(&self, date: Date, twilight: TwilightType) -> NightWindow;

    /// Position of the sun at a local time, if known.
    fn sun_position(&self, datetime: PrimitiveDateTime) -> Option<SunPosition>;

    /// Position of the moon at a local time, if known.
    fn moon_position(&self, datetime: PrimitiveDateTime) -> Option<MoonPosition>;

    /// Illumination of the moon at a local time, if known.
    fn moon_illumination(&self, datetime: PrimitiveDateTime) -> Option<MoonIllumination>;
}

/// Location-free fallback: 19:00 to 05:00 the next morning, no positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedNight;

const FIXED_SUNSET: Time = time!(19:00);
const FIXED_NIGHT_LENGTH: Duration = Duration::hours(10);

impl Ephemeris for FixedNight {
    fn night_window(&self, date: Date, _twilight: TwilightType) -> NightWindow {
        let sunset = date.with_time(FIXED_SUNSET);
        NightWindow {
            sunset,
            sunrise: sunset.saturating_add(FIXED_NIGHT_LENGTH),
        }
    }

    fn sun_position(&self, _datetime: PrimitiveDateTime) -> Option<SunPosition> {
        None
    }

    fn moon_position(&self, _datetime: PrimitiveDateTime) -> Option<MoonPosition> {
        None
    }

    fn moon_illumination(&self, _datetime: PrimitiveDateTime) -> Option<MoonIllumination> {
        None
    }
}
