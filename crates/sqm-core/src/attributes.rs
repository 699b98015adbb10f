//! Attribute enrichment for nightly readings.
//!
//! An [`AttributePipeline`] runs an ordered list of [`AttributeModule`]s over
//! one night at a time. Each module can decorate every reading of the night and
//! then the night's best reading. Modules never overwrite values that are
//! already present, except for keys they declare night-scoped: those depend on
//! neighbouring readings and are cleared before every run.
//!
//! | Module | Reading keys | Best-record keys |
//! |--------|--------------|------------------|
//! | [`ReadingCount`] | | `number_of_readings` |
//! | [`SunMoon`] | `sun_position`, `moon_position`, `moon_illumination` | same, copied |
//! | [`CloudRegression`] | `r_squared`, `mean_r_squared` | `mean_r_squared`, `filtered_mean_r_squared` |
//! | [`RawColumns`] | `raw` | `raw`, copied |
//! | [`SunMoonCloudsFilter`] | `filtered_sun_moon_clouds` | `filtered_sun_moon_clouds` |

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Value, json};
use time::{Date, PrimitiveDateTime};
use tracing::debug;

use sqm_store::Partition;
use sqm_types::{Attributes, BestNightlyRecord, NightWindow, TwilightType, format_date, format_datetime};

use crate::catalog::RawRowIndex;
use crate::ephemeris::Ephemeris;
use crate::regression::{self, RegressionWindow};

/// Source of the original data row recorded at a given time.
pub trait RawRowLookup {
    fn row(&self, datetime: PrimitiveDateTime) -> Option<BTreeMap<String, String>>;
}

impl RawRowLookup for RawRowIndex {
    fn row(&self, datetime: PrimitiveDateTime) -> Option<BTreeMap<String, String>> {
        RawRowIndex::row(self, datetime)
    }
}

/// Everything a module may look at for one night.
pub struct NightContext<'a> {
    pub date: Date,
    pub datetimes: &'a [PrimitiveDateTime],
    pub values: &'a [f64],
    /// Astronomical sunset to sunrise.
    pub window: NightWindow,
    pub ephemeris: &'a dyn Ephemeris,
    pub raw_rows: Option<&'a dyn RawRowLookup>,
}

impl NightContext<'_> {
    /// Indices of readings inside the night window.
    pub fn night_indices(&self) -> Vec<usize> {
        self.datetimes
            .iter()
            .enumerate()
            .filter(|(_, dt)| self.window.contains(**dt))
            .map(|(i, _)| i)
            .collect()
    }
}

/// One step of the attribute pipeline.
pub trait AttributeModule {
    fn name(&self) -> &'static str;

    /// Keys that depend on the whole night and are recomputed on every run.
    fn night_scoped_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Decorate each reading; `attributes` is index-aligned with the context.
    fn annotate_readings(&self, _ctx: &NightContext<'_>, _attributes: &mut [Attributes]) {}

    /// Decorate the record of the reading at index `best`.
    fn annotate_best(
        &self,
        _ctx: &NightContext<'_>,
        _best: usize,
        _night_attributes: &[Attributes],
        _record: &mut Attributes,
    ) {
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn is_set(attributes: &Attributes, key: &str) -> bool {
    attributes.get(key).is_some_and(|v| !v.is_null())
}

fn number(attributes: &Attributes, key: &str) -> Option<f64> {
    attributes.get(key).and_then(Value::as_f64)
}

fn nested_number(attributes: &Attributes, key: &str, field: &str) -> Option<f64> {
    attributes.get(key)?.get(field)?.as_f64()
}

fn copy_key(from: &Attributes, to: &mut Attributes, key: &str) {
    to.insert(key.to_string(), from.get(key).cloned().unwrap_or(Value::Null));
}

/// A reading as a standalone object: `{datetime, reading, ...attributes}`.
fn reading_record(
    datetime: PrimitiveDateTime,
    value: f64,
    attributes: &Attributes,
    skip: &str,
) -> Attributes {
    let mut record = Attributes::new();
    record.insert("datetime".into(), json!(format_datetime(datetime)));
    record.insert("reading".into(), json!(value));
    for (key, attribute) in attributes {
        if key != skip {
            record.insert(key.clone(), attribute.clone());
        }
    }
    record
}

/// Counts the readings inside the night window.
#[derive(Debug, Default)]
pub struct ReadingCount;

impl AttributeModule for ReadingCount {
    fn name(&self) -> &'static str {
        "reading_count"
    }

    fn annotate_best(
        &self,
        ctx: &NightContext<'_>,
        _best: usize,
        _night_attributes: &[Attributes],
        record: &mut Attributes,
    ) {
        record.insert("number_of_readings".into(), json!(ctx.night_indices().len()));
    }
}

/// Sun and moon geometry at each reading.
#[derive(Debug, Default)]
pub struct SunMoon;

const SUN_MOON_KEYS: [&str; 3] = ["sun_position", "moon_position", "moon_illumination"];

impl AttributeModule for SunMoon {
    fn name(&self) -> &'static str {
        "sun_moon"
    }

    fn annotate_readings(&self, ctx: &NightContext<'_>, attributes: &mut [Attributes]) {
        for (datetime, attrs) in ctx.datetimes.iter().zip(attributes.iter_mut()) {
            if is_set(attrs, "sun_position") {
                continue;
            }
            attrs.insert(
                "sun_position".into(),
                to_json(&ctx.ephemeris.sun_position(*datetime)),
            );
            attrs.insert(
                "moon_position".into(),
                to_json(&ctx.ephemeris.moon_position(*datetime)),
            );
            attrs.insert(
                "moon_illumination".into(),
                to_json(&ctx.ephemeris.moon_illumination(*datetime)),
            );
        }
    }

    fn annotate_best(
        &self,
        _ctx: &NightContext<'_>,
        best: usize,
        night_attributes: &[Attributes],
        record: &mut Attributes,
    ) {
        let Some(attrs) = night_attributes.get(best) else {
            return;
        };
        for key in SUN_MOON_KEYS {
            copy_key(attrs, record, key);
        }
    }
}

/// Sliding-window regression as a cloud indicator.
#[derive(Debug, Clone)]
pub struct CloudRegression {
    pub window: RegressionWindow,
    /// Readings with a mean at or above this are considered cloudy.
    pub mean_r_squared_threshold: f64,
}

impl AttributeModule for CloudRegression {
    fn name(&self) -> &'static str {
        "cloud_regression"
    }

    fn night_scoped_keys(&self) -> &'static [&'static str] {
        &["r_squared", "mean_r_squared"]
    }

    fn annotate_readings(&self, ctx: &NightContext<'_>, attributes: &mut [Attributes]) {
        let result = regression::compute(ctx.datetimes, ctx.values, ctx.window, &self.window);
        for (i, attrs) in attributes.iter_mut().enumerate() {
            let r_squared = result.r_squared.get(i).copied().flatten();
            let mean = result.mean_r_squared.get(i).copied().flatten();
            attrs.insert("r_squared".into(), json!(r_squared));
            attrs.insert("mean_r_squared".into(), json!(mean));
        }
    }

    fn annotate_best(
        &self,
        ctx: &NightContext<'_>,
        best: usize,
        night_attributes: &[Attributes],
        record: &mut Attributes,
    ) {
        let night = ctx.night_indices();
        let mean_of = |i: usize| night_attributes.get(i).and_then(|a| number(a, "mean_r_squared"));

        let clear: Vec<usize> = night
            .iter()
            .copied()
            .filter(|&i| mean_of(i).is_some_and(|m| m < self.mean_r_squared_threshold))
            .collect();
        let brightest = clear.iter().copied().fold(None, |best: Option<usize>, i| match best {
            Some(b) if ctx.values[i] <= ctx.values[b] => Some(b),
            _ => Some(i),
        });
        let filtered = match brightest {
            Some(i) => {
                let mut sub = reading_record(
                    ctx.datetimes[i],
                    ctx.values[i],
                    &night_attributes[i],
                    "",
                );
                sub.insert("number_of_readings".into(), json!(clear.len()));
                Value::Object(sub)
            }
            None => Value::Null,
        };
        record.insert("filtered_mean_r_squared".into(), filtered);

        let mean = mean_of(best).or_else(|| {
            let target = ctx.datetimes[best];
            night
                .iter()
                .copied()
                .filter(|&i| mean_of(i).is_some())
                .fold(None, |closest: Option<usize>, i| {
                    let distance = |j: usize| (ctx.datetimes[j] - target).abs();
                    match closest {
                        Some(c) if distance(i) >= distance(c) => Some(c),
                        _ => Some(i),
                    }
                })
                .and_then(mean_of)
        });
        record.insert("mean_r_squared".into(), json!(mean));
    }
}

/// The original data row of each reading.
#[derive(Debug, Default)]
pub struct RawColumns;

impl AttributeModule for RawColumns {
    fn name(&self) -> &'static str {
        "raw_columns"
    }

    fn annotate_readings(&self, ctx: &NightContext<'_>, attributes: &mut [Attributes]) {
        for (datetime, attrs) in ctx.datetimes.iter().zip(attributes.iter_mut()) {
            if is_set(attrs, "raw") {
                continue;
            }
            let row = ctx.raw_rows.and_then(|lookup| lookup.row(*datetime));
            attrs.insert("raw".into(), to_json(&row));
        }
    }

    fn annotate_best(
        &self,
        _ctx: &NightContext<'_>,
        best: usize,
        night_attributes: &[Attributes],
        record: &mut Attributes,
    ) {
        if let Some(attrs) = night_attributes.get(best) {
            copy_key(attrs, record, "raw");
        }
    }
}

/// Thresholds for [`SunMoonCloudsFilter`]; elevations in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterThresholds {
    pub mean_r_squared: f64,
    pub sun_elevation: f64,
    pub moon_elevation: f64,
    pub moon_illumination: f64,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            mean_r_squared: 0.04,
            sun_elevation: -12.0,
            moon_elevation: -10.0,
            moon_illumination: 0.1,
        }
    }
}

/// Drops readings spoiled by sun, moon or clouds.
///
/// Needs the attributes of [`SunMoon`] and [`CloudRegression`], so it must run
/// after both.
#[derive(Debug, Clone, Default)]
pub struct SunMoonCloudsFilter {
    pub thresholds: FilterThresholds,
}

const FILTERED_KEY: &str = "filtered_sun_moon_clouds";

impl SunMoonCloudsFilter {
    /// Returns true if the reading should be left out.
    ///
    /// A missing mean excludes; missing geometry does not.
    pub fn excludes(&self, attributes: &Attributes) -> bool {
        let t = &self.thresholds;
        match number(attributes, "mean_r_squared") {
            None => return true,
            Some(mean) if mean >= t.mean_r_squared => return true,
            Some(_) => {}
        }
        if nested_number(attributes, "sun_position", "altitude")
            .is_some_and(|altitude| altitude >= t.sun_elevation.to_radians())
        {
            return true;
        }
        let moon_up = nested_number(attributes, "moon_position", "altitude")
            .is_some_and(|altitude| altitude >= t.moon_elevation.to_radians());
        let moon_bright = nested_number(attributes, "moon_illumination", "fraction")
            .is_some_and(|fraction| fraction >= t.moon_illumination);
        moon_up && moon_bright
    }
}

impl AttributeModule for SunMoonCloudsFilter {
    fn name(&self) -> &'static str {
        "sun_moon_clouds_filter"
    }

    fn night_scoped_keys(&self) -> &'static [&'static str] {
        &[FILTERED_KEY]
    }

    fn annotate_readings(&self, ctx: &NightContext<'_>, attributes: &mut [Attributes]) {
        for (i, attrs) in attributes.iter_mut().enumerate() {
            let value = if self.excludes(attrs) {
                Value::Null
            } else {
                Value::Object(reading_record(ctx.datetimes[i], ctx.values[i], attrs, FILTERED_KEY))
            };
            attrs.insert(FILTERED_KEY.into(), value);
        }
    }

    fn annotate_best(
        &self,
        ctx: &NightContext<'_>,
        _best: usize,
        night_attributes: &[Attributes],
        record: &mut Attributes,
    ) {
        let kept: Vec<usize> = (0..ctx.values.len())
            .filter(|&i| night_attributes.get(i).is_some_and(|a| !self.excludes(a)))
            .collect();
        let brightest = kept.iter().copied().fold(None, |best: Option<usize>, i| match best {
            Some(b) if ctx.values[i] <= ctx.values[b] => Some(b),
            _ => Some(i),
        });
        let value = match brightest {
            Some(i) => {
                let mut sub = reading_record(
                    ctx.datetimes[i],
                    ctx.values[i],
                    &night_attributes[i],
                    FILTERED_KEY,
                );
                sub.insert("number_of_readings".into(), json!(kept.len()));
                Value::Object(sub)
            }
            None => Value::Null,
        };
        record.insert(FILTERED_KEY.into(), value);
    }
}

/// Ordered attribute modules plus the geometry they share.
pub struct AttributePipeline {
    modules: Vec<Box<dyn AttributeModule>>,
    ephemeris: Box<dyn Ephemeris>,
}

impl std::fmt::Debug for AttributePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributePipeline")
            .field("modules", &self.module_names())
            .finish_non_exhaustive()
    }
}

impl AttributePipeline {
    /// A pipeline that only counts readings.
    pub fn new(ephemeris: Box<dyn Ephemeris>) -> Self {
        Self {
            modules: vec![Box::new(ReadingCount)],
            ephemeris,
        }
    }

    /// Append a module; a module with the same name is not added twice.
    #[must_use]
    pub fn with_module(mut self, module: impl AttributeModule + 'static) -> Self {
        if self.modules.iter().any(|m| m.name() == module.name()) {
            debug!("Attribute module {} already included", module.name());
            return self;
        }
        debug!("Including attribute module {}", module.name());
        self.modules.push(Box::new(module));
        self
    }

    pub fn module_names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn ephemeris(&self) -> &dyn Ephemeris {
        self.ephemeris.as_ref()
    }

    fn context<'a>(
        &'a self,
        date: Date,
        partition: &'a Partition,
        raw_rows: Option<&'a dyn RawRowLookup>,
    ) -> NightContext<'a> {
        NightContext {
            date,
            datetimes: &partition.datetimes,
            values: &partition.values,
            window: self.ephemeris.night_window(date, TwilightType::Astronomical),
            ephemeris: self.ephemeris.as_ref(),
            raw_rows,
        }
    }

    /// Recompute the attributes of every reading in `partition`.
    pub fn annotate_night(
        &self,
        date: Date,
        partition: &mut Partition,
        raw_rows: Option<&dyn RawRowLookup>,
    ) {
        partition.normalize();
        let mut attributes = std::mem::take(&mut partition.attributes);
        for attrs in &mut attributes {
            for module in &self.modules {
                for key in module.night_scoped_keys() {
                    attrs.remove(*key);
                }
            }
        }
        {
            let ctx = self.context(date, partition, raw_rows);
            for module in &self.modules {
                module.annotate_readings(&ctx, &mut attributes);
            }
        }
        partition.attributes = attributes;
    }

    /// The night's brightest reading with its record attributes.
    ///
    /// `partition` must already be annotated. Returns `None` for an empty night.
    pub fn best_record(
        &self,
        date: Date,
        partition: &Partition,
        raw_rows: Option<&dyn RawRowLookup>,
    ) -> Option<BestNightlyRecord> {
        let (best, reading) = partition.best()?;
        let ctx = self.context(date, partition, raw_rows);
        let mut record = Attributes::new();
        record.insert("date".into(), json!(format_date(date)));
        for module in &self.modules {
            module.annotate_best(&ctx, best, &partition.attributes, &mut record);
        }
        Some(BestNightlyRecord {
            date,
            datetime: reading.datetime,
            value: reading.value,
            attributes: record,
        })
    }
}
