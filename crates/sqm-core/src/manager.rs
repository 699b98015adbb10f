//! Query front end for one station.
//!
//! Every query first reconciles the files that may hold the requested span,
//! applies the resulting diff to the night partitions, re-annotates the nights
//! it touched and refreshes their best-of-night records. Only then is the
//! answer read back from the stores.

use std::collections::BTreeSet;

use time::macros::time;
use time::{Date, Duration, PrimitiveDateTime, Time};
use tracing::debug;

use sqm_store::{MemoryPartitions, PartitionStore, RollupStore};
use sqm_types::{
    AnnotatedReading, BestNightlyRecord, ReadingDiff, ReadingsRange, StationInfo, TwilightType,
    nights_in_range,
};

use crate::attributes::{AttributePipeline, RawRowLookup};
use crate::catalog::RawRowIndex;
use crate::error::Result;
use crate::fileset::Fileset;

const NOON: Time = time!(12:00);

/// Margin added around a span when choosing files, so that readings near a
/// month boundary are not missed.
const FILE_MARGIN: Duration = Duration::hours(12);

/// Dataset of one station: its files, stores and attribute pipeline.
pub struct DatasetManager {
    fileset: Fileset,
    partitions: Box<dyn PartitionStore>,
    rollups: Box<dyn RollupStore>,
    pipeline: AttributePipeline,
    raw_rows: Option<RawRowIndex>,
    default_twilight: TwilightType,
    station_info: StationInfo,
}

impl std::fmt::Debug for DatasetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetManager")
            .field("fileset", &self.fileset)
            .field("pipeline", &self.pipeline)
            .field("raw_rows", &self.raw_rows.is_some())
            .finish_non_exhaustive()
    }
}

impl DatasetManager {
    pub fn new(
        mut fileset: Fileset,
        partitions: Box<dyn PartitionStore>,
        rollups: Box<dyn RollupStore>,
        pipeline: AttributePipeline,
    ) -> Self {
        let station_info = fileset.station_info();
        Self {
            fileset,
            partitions,
            rollups,
            pipeline,
            raw_rows: None,
            default_twilight: TwilightType::default(),
            station_info,
        }
    }

    /// Record the original data row of each reading under `raw`.
    #[must_use]
    pub fn with_raw_rows(mut self) -> Self {
        self.raw_rows = Some(RawRowIndex::new(self.fileset.catalog().clone()));
        self
    }

    /// Twilight used by [`Self::nightly_readings`] when none is given.
    #[must_use]
    pub fn with_default_twilight(mut self, twilight: TwilightType) -> Self {
        self.default_twilight = twilight;
        self
    }

    pub fn station(&self) -> &str {
        self.fileset.station()
    }

    pub fn fileset(&self) -> &Fileset {
        &self.fileset
    }

    pub fn station_info(&self) -> &StationInfo {
        &self.station_info
    }

    /// The earliest and latest readings of the station.
    pub fn readings_range(&mut self) -> Result<ReadingsRange> {
        if let Some(range) = self.fileset.earliest_and_latest_readings() {
            return Ok(range);
        }
        let mut files = self.fileset.files_for_latest();
        for file in self.fileset.files_for_earliest() {
            if !files.contains(&file) {
                files.push(file);
            }
        }
        self.sync(&files)?;
        Ok(ReadingsRange {
            earliest: self.partitions.earliest(),
            latest: self.partitions.latest(),
        })
    }

    /// Readings from noon on `date` to noon the next day.
    pub fn daily_readings(&mut self, date: Date) -> Result<Vec<AnnotatedReading>> {
        let start = date.with_time(NOON);
        self.sync_span(start, start.saturating_add(Duration::days(1)))?;
        Ok(self.partitions.partition(date, true).annotated())
    }

    /// Readings between sunset on `date` and the following sunrise.
    pub fn nightly_readings(
        &mut self,
        date: Date,
        twilight: Option<TwilightType>,
    ) -> Result<Vec<AnnotatedReading>> {
        let twilight = twilight.unwrap_or(self.default_twilight);
        let window = self.pipeline.ephemeris().night_window(date, twilight);
        debug!(
            "Night of {} ({}) runs {} to {}",
            date, twilight, window.sunset, window.sunrise
        );
        self.readings_in_range(window.sunset, window.sunrise)
    }

    /// Every reading with `start <= datetime <= end`.
    pub fn readings_in_range(
        &mut self,
        start: PrimitiveDateTime,
        end: PrimitiveDateTime,
    ) -> Result<Vec<AnnotatedReading>> {
        self.sync_span(start, end)?;
        let mut readings = Vec::new();
        for date in nights_in_range(start, end) {
            readings.extend(
                self.partitions
                    .partition(date, true)
                    .annotated()
                    .into_iter()
                    .filter(|r| start <= r.datetime && r.datetime <= end),
            );
        }
        Ok(readings)
    }

    /// Best-of-night records between two nights, inclusive.
    ///
    /// With both bounds only the files for that span are reconciled. Otherwise
    /// every file is, and a missing bound means the first or last night.
    pub fn best_nightly_readings(
        &mut self,
        start: Option<Date>,
        end: Option<Date>,
    ) -> Result<Vec<BestNightlyRecord>> {
        if let (Some(start), Some(end)) = (start, end) {
            let from = start.with_time(NOON);
            let to = end.with_time(NOON).saturating_add(Duration::days(1));
            self.sync_span(from, to)?;
            return Ok(self.rollups.between(start, end));
        }

        self.refresh_all()?;
        if start.is_none() && end.is_none() {
            return Ok(self.rollups.all());
        }
        let first = self.partitions.earliest().map(|r| r.night());
        let last = self.partitions.latest().map(|r| r.night());
        match (start.or(first), end.or(last)) {
            (Some(start), Some(end)) => Ok(self.rollups.between(start, end)),
            _ => Ok(Vec::new()),
        }
    }

    /// Reconcile every known file.
    pub fn refresh_all(&mut self) -> Result<()> {
        let files = self.fileset.all_files().to_vec();
        self.sync(&files)
    }

    fn sync_span(&mut self, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Result<()> {
        let files = self.fileset.files_for(
            start.saturating_sub(FILE_MARGIN),
            end.saturating_add(FILE_MARGIN),
        );
        self.sync(&files)
    }

    fn sync(&mut self, files: &[String]) -> Result<()> {
        let diff = self.fileset.new_readings_from(files)?;
        if diff.is_empty() {
            return Ok(());
        }
        if let Some(index) = &mut self.raw_rows {
            index.refresh(files);
        }
        self.apply(diff)
    }

    /// Apply a diff, removals first, then rebuild the nights it touched.
    fn apply(&mut self, diff: ReadingDiff) -> Result<()> {
        let removed = MemoryPartitions::from_pairs(
            diff.removed
                .iter()
                .map(|(datetime, value)| (datetime.as_str(), value.as_str())),
        );
        let mut touched = self.partitions.remove(&removed)?;
        touched.extend(
            self.partitions
                .add(&MemoryPartitions::from_raw(&diff.added))?,
        );
        if touched.is_empty() {
            return Ok(());
        }
        debug!(
            "Station {}: rebuilding {} nights",
            self.fileset.station(),
            touched.len()
        );

        let raw_rows = self.raw_rows.as_ref().map(|index| index as &dyn RawRowLookup);
        let mut records = Vec::new();
        let mut emptied = BTreeSet::new();
        for date in touched {
            let mut partition = self.partitions.partition(date, true);
            if partition.is_empty() {
                emptied.insert(date);
                continue;
            }
            self.pipeline.annotate_night(date, &mut partition, raw_rows);
            if let Some(record) = self.pipeline.best_record(date, &partition, raw_rows) {
                records.push(record);
            }
            self.partitions.set_partition(date, partition)?;
        }
        self.rollups.set_many(records)?;
        self.rollups.remove_dates(&emptied)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use sqm_store::{MemoryPartitions, MemoryRollups, MemorySnapshots};
    use time::macros::{date, datetime};

    use crate::catalog::Catalog;
    use crate::ephemeris::FixedNight;
    use crate::fileset::Strategy;

    fn write(root: &Path, name: &str, rows: &[(&str, &str)]) {
        let mut content = String::from("Local Date, Local Time, MSAS\n");
        for (datetime, value) in rows {
            let (date, time) = datetime.split_once(' ').unwrap();
            content.push_str(&format!("{date}, {time}, {value}\n"));
        }
        fs::write(root.join(name), content).unwrap();
    }

    fn manager(root: &Path) -> DatasetManager {
        let fileset = Fileset::new(
            "test",
            Catalog::new(root),
            Box::new(MemorySnapshots::new()),
            Strategy::Distrusting,
        );
        DatasetManager::new(
            fileset,
            Box::new(MemoryPartitions::new()),
            Box::new(MemoryRollups::new()),
            AttributePipeline::new(Box::new(FixedNight)),
        )
    }

    #[test]
    fn test_best_nightly_example() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            &[
                ("2024-01-01 22:00:00", "19.5"),
                ("2024-01-02 02:00:00", "21.2"),
                ("2024-01-02 05:00:00", "20.0"),
            ],
        );
        let mut manager = manager(dir.path());
        let best = manager.best_nightly_readings(None, None).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].date, date!(2024 - 01 - 01));
        assert_eq!(best[0].datetime, datetime!(2024-01-02 02:00));
        assert_eq!(best[0].value, 21.2);
        assert_eq!(best[0].attributes["number_of_readings"], 3);
    }

    #[test]
    fn test_readings_range_from_dataset() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        write(dir.path(), "b.csv", &[("2024-02-03 23:00:00", "20.5")]);
        let mut manager = manager(dir.path());
        let range = manager.readings_range().unwrap();
        assert_eq!(range.earliest.unwrap().datetime, datetime!(2024-01-01 22:00));
        assert_eq!(range.latest.unwrap().value, 20.5);
    }

    #[test]
    fn test_daily_and_ranged_readings() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            &[
                ("2024-01-01 11:00:00", "10.0"),
                ("2024-01-01 22:00:00", "19.5"),
                ("2024-01-02 02:00:00", "21.2"),
                ("2024-01-02 13:00:00", "9.0"),
            ],
        );
        let mut manager = manager(dir.path());

        let daily = manager.daily_readings(date!(2024 - 01 - 01)).unwrap();
        let times: Vec<_> = daily.iter().map(|r| r.datetime).collect();
        assert_eq!(
            times,
            vec![datetime!(2024-01-01 22:00), datetime!(2024-01-02 02:00)]
        );

        let ranged = manager
            .readings_in_range(datetime!(2024-01-01 10:00), datetime!(2024-01-01 23:00))
            .unwrap();
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].value, 10.0);

        let nightly = manager.nightly_readings(date!(2024 - 01 - 01), None).unwrap();
        assert_eq!(nightly.len(), 2);
    }

    #[test]
    fn test_conflicting_files_leave_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut manager = manager(dir.path());
        manager.refresh_all().unwrap();
        write(dir.path(), "b.csv", &[("2024-01-01 22:00:00", "19.6")]);
        let values: Vec<f64> = manager
            .daily_readings(date!(2024 - 01 - 01))
            .unwrap()
            .iter()
            .map(|r| r.value)
            .collect();
        assert_eq!(values, vec![19.5, 19.6]);

        fs::remove_file(dir.path().join("a.csv")).unwrap();
        fs::remove_file(dir.path().join("b.csv")).unwrap();
        manager.refresh_all().unwrap();
        assert!(manager.daily_readings(date!(2024 - 01 - 01)).unwrap().is_empty());
        assert!(manager.best_nightly_readings(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_reading_kept_while_any_file_holds_it() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        write(dir.path(), "b.csv", &[("2024-01-01 22:00:00", "19.50")]);
        let mut manager = manager(dir.path());
        assert_eq!(manager.daily_readings(date!(2024 - 01 - 01)).unwrap().len(), 1);

        fs::remove_file(dir.path().join("b.csv")).unwrap();
        let readings = manager.daily_readings(date!(2024 - 01 - 01)).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 19.5);
    }

    #[test]
    fn test_best_with_one_bound() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            &[
                ("2024-01-01 22:00:00", "19.5"),
                ("2024-01-02 22:00:00", "19.6"),
                ("2024-01-03 22:00:00", "19.7"),
            ],
        );
        let mut manager = manager(dir.path());
        let from_second = manager
            .best_nightly_readings(Some(date!(2024 - 01 - 02)), None)
            .unwrap();
        assert_eq!(from_second.len(), 2);
        let until_second = manager
            .best_nightly_readings(None, Some(date!(2024 - 01 - 02)))
            .unwrap();
        assert_eq!(until_second.len(), 2);
        let only_third = manager
            .best_nightly_readings(Some(date!(2024 - 01 - 03)), Some(date!(2024 - 01 - 03)))
            .unwrap();
        assert_eq!(only_third.len(), 1);
        assert_eq!(only_third[0].value, 19.7);
    }
}
