//! The set of data files behind one station and their reconciliation.
//!
//! A [`Fileset`] knows which files exist, which of them a query needs, and
//! what changed in them since they were last read. Change detection compares a
//! file's modification time with the load time of its snapshot; the readings
//! of a changed file are diffed against that snapshot to produce a
//! [`ReadingDiff`].
//!
//! A reading is only reported as removed once no remaining file holds the same
//! reading, so overlapping exports never lose data. Two pairs are the same
//! reading when they parse to the same datetime and value, matching how the
//! dataset stores them.

use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

use time::PrimitiveDateTime;
use tracing::{debug, info, warn};

use sqm_store::SnapshotStore;
use sqm_types::{
    RawReadings, Reading, ReadingDiff, ReadingsRange, RemovedReadings, StationInfo, YearMonth,
    months_in_range,
};

use crate::catalog::Catalog;
use crate::error::Result;

/// How much a fileset assumes about file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// File names carry the month they cover and sort chronologically.
    Trusting,
    /// Nothing is assumed; every query reads every file.
    Distrusting,
    /// Files are never read; the caches are served as they are.
    NoNew,
}

/// Data files of one station.
pub struct Fileset {
    station: String,
    catalog: Catalog,
    snapshots: Box<dyn SnapshotStore>,
    strategy: Strategy,
    files: Vec<String>,
    months: BTreeMap<YearMonth, Vec<String>>,
    station_info: Option<StationInfo>,
    /// Readings of vanished files, held until a reconciliation reports them.
    pending_removed: RemovedReadings,
}

impl std::fmt::Debug for Fileset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fileset")
            .field("station", &self.station)
            .field("strategy", &self.strategy)
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

impl Fileset {
    /// Scan the station's files.
    ///
    /// A [`Strategy::Trusting`] fileset whose file names carry no month falls
    /// back to [`Strategy::Distrusting`]. Snapshots of files that disappeared
    /// while nothing was watching are queued for removal.
    pub fn new(
        station: impl Into<String>,
        catalog: Catalog,
        snapshots: Box<dyn SnapshotStore>,
        strategy: Strategy,
    ) -> Self {
        let station = station.into();
        let files = catalog.scan();
        debug!("Station {} has {} data files", station, files.len());

        let mut fileset = Self {
            station,
            catalog,
            snapshots,
            strategy,
            files,
            months: BTreeMap::new(),
            station_info: None,
            pending_removed: RemovedReadings::new(),
        };
        fileset.index_months();
        if strategy != Strategy::NoNew {
            fileset.forget_orphans();
        }
        fileset
    }

    pub fn station(&self) -> &str {
        &self.station
    }

    /// The strategy in effect, after any fallback.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Every known file, sorted.
    pub fn all_files(&self) -> &[String] {
        &self.files
    }

    /// Files that may hold readings between `start` and `end`.
    pub fn files_for(&self, start: PrimitiveDateTime, end: PrimitiveDateTime) -> Vec<String> {
        if self.strategy != Strategy::Trusting {
            return self.files.clone();
        }
        let mut files: Vec<String> = Vec::new();
        for month in months_in_range(start, end) {
            for file in self.months.get(&month).into_iter().flatten() {
                if !files.contains(file) {
                    files.push(file.clone());
                }
            }
        }
        files
    }

    /// Files that may hold the most recent reading.
    pub fn files_for_latest(&self) -> Vec<String> {
        match self.strategy {
            Strategy::Trusting => self.files.last().cloned().into_iter().collect(),
            _ => self.files.clone(),
        }
    }

    /// Files that may hold the oldest reading.
    pub fn files_for_earliest(&self) -> Vec<String> {
        match self.strategy {
            Strategy::Trusting => self.files.first().cloned().into_iter().collect(),
            _ => self.files.clone(),
        }
    }

    /// First reading of the first file and last reading of the last file.
    ///
    /// Only a trusting fileset answers; the others return `None` and leave the
    /// question to the dataset.
    pub fn earliest_and_latest_readings(&self) -> Option<ReadingsRange> {
        if self.strategy != Strategy::Trusting {
            return None;
        }
        let first = self.files.first()?;
        let last = self.files.last()?;

        let earliest = match self.catalog.first_reading(first) {
            Ok((datetime, value)) => Reading::from_raw(&datetime, &value).ok(),
            Err(e) => {
                warn!("Could not get first reading from {}: {}", first, e);
                None
            }
        };
        let latest = match self.catalog.last_reading(last) {
            Ok(Some((datetime, value))) => Reading::from_raw(&datetime, &value).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not get last reading from {}: {}", last, e);
                None
            }
        };
        match (earliest, latest) {
            (Some(earliest), Some(latest)) => Some(ReadingsRange {
                earliest: Some(earliest),
                latest: Some(latest),
            }),
            _ => None,
        }
    }

    /// Location and name of the station.
    ///
    /// Taken from `.info` if present, else from the first data file that
    /// describes it, else just the station id. Computed once.
    pub fn station_info(&mut self) -> StationInfo {
        if let Some(info) = &self.station_info {
            return info.clone();
        }
        let info = self
            .catalog
            .station_info_from_dot_info()
            .or_else(|| {
                self.station_info_files()
                    .iter()
                    .find_map(|file| self.catalog.station_info_from(file))
            })
            .unwrap_or_else(|| StationInfo::named(self.station.clone()));
        self.station_info = Some(info.clone());
        info
    }

    fn station_info_files(&self) -> Vec<String> {
        let mut files = self.files.clone();
        match self.strategy {
            Strategy::Distrusting => {
                files.sort_by_key(|file| std::cmp::Reverse(self.catalog.modified(file)));
            }
            _ => files.reverse(),
        }
        files
    }

    /// Returns true if `file` must be read again.
    pub fn has_file_changed(&self, file: &str) -> bool {
        if self.strategy == Strategy::NoNew {
            return false;
        }
        if !self.catalog.exists(file) {
            return true;
        }
        match (self.catalog.modified(file), self.snapshots.load_time(file)) {
            (_, None) => true,
            (Some(modified), Some(loaded)) => modified > loaded,
            (None, Some(_)) => true,
        }
    }

    /// Readings added to and removed from `files` since they were last read.
    ///
    /// Also picks up files that appeared or vanished anywhere in the station;
    /// new files are read whether or not they are in `files`. A file that
    /// fails to parse is skipped and retried next time.
    pub fn new_readings_from(&mut self, files: &[String]) -> Result<ReadingDiff> {
        if self.strategy == Strategy::NoNew {
            return Ok(ReadingDiff::default());
        }
        let appeared = self.rescan()?;

        let mut changed: Vec<&String> = Vec::new();
        for file in files.iter().chain(&appeared) {
            if !changed.contains(&file) && self.has_file_changed(file) {
                changed.push(file);
            }
        }

        let mut added = RawReadings::new();
        let mut removed = std::mem::take(&mut self.pending_removed);
        if changed.is_empty() {
            return Ok(ReadingDiff { added, removed });
        }

        for file in changed {
            if !self.catalog.exists(file) {
                debug!("{} disappeared", file);
                removed.extend(self.snapshots.readings(file));
                self.snapshots.deleted_files(std::slice::from_ref(file))?;
                continue;
            }

            let loaded_at = SystemTime::now();
            let fresh = match self.catalog.readings_from(file) {
                Ok(readings) => readings,
                Err(e) => {
                    warn!("Could not get readings from {}: {}", file, e);
                    continue;
                }
            };
            let previous = self.snapshots.readings(file);
            removed.extend(difference(&previous, &fresh));
            added.extend(difference(&fresh, &previous));
            self.snapshots.set_readings(file, &fresh)?;
            self.snapshots.set_load_time(file, loaded_at);
            debug!("Loaded {} readings from {}", fresh.len(), file);
        }

        self.retain_unclaimed(&mut removed);
        if !added.is_empty() || !removed.is_empty() {
            info!(
                "Station {}: {} readings added, {} removed",
                self.station,
                added.len(),
                removed.len()
            );
        }
        Ok(ReadingDiff { added, removed })
    }

    /// Refresh the file list and return the files that appeared.
    fn rescan(&mut self) -> Result<Vec<String>> {
        let scanned = self.catalog.scan();
        let appeared: Vec<String> = scanned
            .iter()
            .filter(|file| !self.files.contains(file))
            .cloned()
            .collect();
        let vanished: Vec<String> = self
            .files
            .iter()
            .filter(|file| !scanned.contains(file))
            .cloned()
            .collect();

        self.snapshots.new_files(&appeared)?;
        for file in &vanished {
            self.pending_removed.extend(self.snapshots.readings(file));
        }
        self.snapshots.deleted_files(&vanished)?;
        self.files = scanned;

        if !appeared.is_empty() || !vanished.is_empty() {
            debug!(
                "Station {}: {} files appeared, {} vanished",
                self.station,
                appeared.len(),
                vanished.len()
            );
            self.index_months();
        }

        let mut pending = std::mem::take(&mut self.pending_removed);
        self.retain_unclaimed(&mut pending);
        self.pending_removed = pending;
        Ok(appeared)
    }

    /// Queue the snapshots of files no longer on disk for removal.
    fn forget_orphans(&mut self) {
        let orphans: Vec<String> = self
            .snapshots
            .known_files()
            .into_iter()
            .filter(|file| !self.files.contains(file))
            .collect();
        if orphans.is_empty() {
            return;
        }
        debug!("Station {}: {} snapshots without a file", self.station, orphans.len());
        for file in &orphans {
            self.pending_removed.extend(self.snapshots.readings(file));
        }
        if let Err(e) = self.snapshots.deleted_files(&orphans) {
            warn!("Could not drop stale snapshots of {}: {}", self.station, e);
        }
    }

    /// Drop every candidate that some known file still contains.
    ///
    /// Each snapshot is loaded once regardless of how many candidates there are.
    fn retain_unclaimed(&self, candidates: &mut RemovedReadings) {
        for file in &self.files {
            if candidates.is_empty() {
                return;
            }
            let held: BTreeSet<ReadingKey> = self
                .snapshots
                .readings(file)
                .iter()
                .map(|(datetime, value)| ReadingKey::new(datetime, value))
                .collect();
            candidates.retain(|(datetime, value)| !held.contains(&ReadingKey::new(datetime, value)));
        }
    }

    fn index_months(&mut self) {
        self.months.clear();
        if self.strategy != Strategy::Trusting {
            return;
        }
        for file in &self.files {
            for month in months_in_name(file) {
                self.months.entry(month).or_default().push(file.clone());
            }
        }
        if self.months.is_empty() {
            info!(
                "No month found in the file names of {}; reading every file",
                self.station
            );
            self.strategy = Strategy::Distrusting;
        }
    }
}

/// Identity of a file reading as the dataset sees it.
///
/// Pairs that do not parse never reach the dataset and fall back to their
/// strings.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ReadingKey {
    Parsed(PrimitiveDateTime, u64),
    Unparsed(String, String),
}

impl ReadingKey {
    fn new(datetime: &str, value: &str) -> Self {
        match Reading::from_raw(datetime, value) {
            Ok(reading) => {
                let (datetime, bits) = reading.identity();
                Self::Parsed(datetime, bits)
            }
            Err(_) => Self::Unparsed(datetime.to_string(), value.to_string()),
        }
    }
}

/// Pairs of `a` not present with the same value in `b`.
fn difference<'a>(
    a: &'a RawReadings,
    b: &'a RawReadings,
) -> impl Iterator<Item = (String, String)> + 'a {
    a.iter()
        .filter(|(datetime, value)| b.get(*datetime) != Some(*value))
        .map(|(datetime, value)| (datetime.clone(), value.clone()))
}

/// Months named in a file path as `YYYYMM` or `YYYY-MM`, at any offset.
fn months_in_name(name: &str) -> Vec<YearMonth> {
    let bytes = name.as_bytes();
    let mut months = Vec::new();
    for start in 0..bytes.len() {
        let rest = &bytes[start..];
        let compact = rest.get(..6).and_then(|s| year_month(&s[..4], &s[4..]));
        let dashed = rest
            .get(..7)
            .filter(|s| s[4] == b'-')
            .and_then(|s| year_month(&s[..4], &s[5..]));
        for month in [compact, dashed].into_iter().flatten() {
            if !months.contains(&month) {
                months.push(month);
            }
        }
    }
    months
}

fn year_month(year: &[u8], month: &[u8]) -> Option<YearMonth> {
    if year.first() == Some(&b'0') {
        return None;
    }
    let year = parse_digits(year)?;
    let month = parse_digits(month)?;
    YearMonth::new(i32::try_from(year).ok()?, u8::try_from(month).ok()?)
}

fn parse_digits(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |n, b| {
        b.is_ascii_digit().then(|| n * 10 + u32::from(b - b'0'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use sqm_store::MemorySnapshots;
    use time::macros::datetime;

    const HEADER: &str = "Local Date, Local Time, MSAS\n";

    fn write(root: &Path, relative: &str, rows: &[(&str, &str)]) {
        let mut content = String::from(HEADER);
        for (datetime, value) in rows {
            let (date, time) = datetime.split_once(' ').unwrap();
            content.push_str(&format!("{date}, {time}, {value}\n"));
        }
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        // Push the mtime past any load time recorded earlier in the test.
        let file = fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    fn fileset(root: &Path, strategy: Strategy) -> Fileset {
        Fileset::new(
            "test",
            Catalog::new(root),
            Box::new(MemorySnapshots::new()),
            strategy,
        )
    }

    fn raw(pairs: &[(&str, &str)]) -> RawReadings {
        pairs
            .iter()
            .map(|(d, v)| (d.to_string(), v.to_string()))
            .collect()
    }

    fn pairs(pairs: &[(&str, &str)]) -> RemovedReadings {
        pairs
            .iter()
            .map(|(d, v)| (d.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_months_in_name() {
        let ym = |y, m| YearMonth::new(y, m).unwrap();
        assert_eq!(months_in_name("202401.dat"), vec![ym(2024, 1)]);
        assert_eq!(months_in_name("sqm_2023-12.csv"), vec![ym(2023, 12)]);
        assert!(months_in_name("station.csv").is_empty());
        assert!(months_in_name("2024-13.csv").is_empty());
        let both = months_in_name("2023/2023-11_to_202312.dat");
        assert!(both.contains(&ym(2023, 11)));
        assert!(both.contains(&ym(2023, 12)));
    }

    #[test]
    fn test_trusting_files_for() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "2024-01.csv", &[("2024-01-10 22:00:00", "20.0")]);
        write(dir.path(), "2024-02.csv", &[("2024-02-10 22:00:00", "20.1")]);
        write(dir.path(), "2024-03.csv", &[("2024-03-10 22:00:00", "20.2")]);

        let set = fileset(dir.path(), Strategy::Trusting);
        assert_eq!(set.strategy(), Strategy::Trusting);
        assert_eq!(
            set.files_for(datetime!(2024-01-31 12:00), datetime!(2024-02-01 12:00)),
            vec!["2024-01.csv".to_string(), "2024-02.csv".to_string()]
        );
        assert_eq!(set.files_for_latest(), vec!["2024-03.csv".to_string()]);
        assert_eq!(set.files_for_earliest(), vec!["2024-01.csv".to_string()]);

        let range = set.earliest_and_latest_readings().unwrap();
        assert_eq!(range.earliest.unwrap().datetime, datetime!(2024-01-10 22:00));
        assert_eq!(range.latest.unwrap().datetime, datetime!(2024-03-10 22:00));
    }

    #[test]
    fn test_trusting_falls_back_without_months() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "alpha.csv", &[("2024-01-10 22:00:00", "20.0")]);
        write(dir.path(), "beta.csv", &[("2024-02-10 22:00:00", "20.1")]);

        let set = fileset(dir.path(), Strategy::Trusting);
        assert_eq!(set.strategy(), Strategy::Distrusting);
        assert_eq!(
            set.files_for(datetime!(2024-01-01 12:00), datetime!(2024-01-02 12:00)),
            set.all_files().to_vec()
        );
        assert!(set.earliest_and_latest_readings().is_none());
    }

    #[test]
    fn test_second_reconciliation_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        let files = set.all_files().to_vec();

        let first = set.new_readings_from(&files).unwrap();
        assert_eq!(first.added, raw(&[("2024-01-01 22:00:00", "19.5")]));
        assert!(first.removed.is_empty());

        // The mtime sits in the future, so move the load time past it.
        set.snapshots
            .set_load_time("a.csv", SystemTime::now() + Duration::from_secs(60));
        assert!(set.new_readings_from(&files).unwrap().is_empty());
    }

    #[test]
    fn test_diff_after_edit() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            &[("2024-01-01 22:00:00", "19.5"), ("2024-01-01 23:00:00", "19.7")],
        );
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();
        set.snapshots.set_load_time("a.csv", SystemTime::now());

        write(
            dir.path(),
            "a.csv",
            &[("2024-01-01 23:00:00", "19.8"), ("2024-01-02 00:00:00", "20.0")],
        );
        let diff = set.new_readings_from(&["a.csv".to_string()]).unwrap();
        assert_eq!(
            diff.added,
            raw(&[("2024-01-01 23:00:00", "19.8"), ("2024-01-02 00:00:00", "20.0")])
        );
        assert_eq!(
            diff.removed,
            pairs(&[("2024-01-01 22:00:00", "19.5"), ("2024-01-01 23:00:00", "19.7")])
        );
    }

    #[test]
    fn test_shared_reading_survives_deletion() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            &[("2024-01-01 22:00:00", "19.5"), ("2024-01-01 23:00:00", "19.7")],
        );
        write(dir.path(), "b.csv", &[("2024-01-01 23:00:00", "19.7")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();

        fs::remove_file(dir.path().join("a.csv")).unwrap();
        let diff = set.new_readings_from(&set.all_files().to_vec()).unwrap();
        assert_eq!(diff.removed, pairs(&[("2024-01-01 22:00:00", "19.5")]));
        assert_eq!(set.all_files(), ["b.csv".to_string()]);
    }

    #[test]
    fn test_conflicting_values_are_all_removed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();
        write(dir.path(), "b.csv", &[("2024-01-01 22:00:00", "19.6")]);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();

        fs::remove_file(dir.path().join("a.csv")).unwrap();
        fs::remove_file(dir.path().join("b.csv")).unwrap();
        let diff = set.new_readings_from(&set.all_files().to_vec()).unwrap();
        assert_eq!(
            diff.removed,
            pairs(&[("2024-01-01 22:00:00", "19.5"), ("2024-01-01 22:00:00", "19.6")])
        );
    }

    #[test]
    fn test_reformatted_value_still_claims_reading() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        write(dir.path(), "b.csv", &[("2024-01-01 22:00:00", "19.50")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();

        fs::remove_file(dir.path().join("b.csv")).unwrap();
        let diff = set.new_readings_from(&set.all_files().to_vec()).unwrap();
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_file_turned_directory_is_purged() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        set.new_readings_from(&set.all_files().to_vec()).unwrap();

        fs::remove_file(dir.path().join("a.csv")).unwrap();
        fs::create_dir(dir.path().join("a.csv")).unwrap();
        let diff = set.new_readings_from(&["a.csv".to_string()]).unwrap();
        assert_eq!(diff.removed, pairs(&[("2024-01-01 22:00:00", "19.5")]));
        assert!(set.snapshots.readings("a.csv").is_empty());
    }

    #[test]
    fn test_orphaned_snapshots_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.csv", &[("2024-01-02 22:00:00", "20.0")]);
        let mut snapshots = MemorySnapshots::new();
        snapshots
            .set_readings("gone.csv", &raw(&[("2024-01-01 22:00:00", "19.5")]))
            .unwrap();
        snapshots.set_load_time("gone.csv", SystemTime::now());

        let mut set = Fileset::new(
            "test",
            Catalog::new(dir.path()),
            Box::new(snapshots),
            Strategy::Distrusting,
        );
        let diff = set.new_readings_from(&set.all_files().to_vec()).unwrap();
        assert_eq!(diff.removed, pairs(&[("2024-01-01 22:00:00", "19.5")]));
        assert_eq!(diff.added, raw(&[("2024-01-02 22:00:00", "20.0")]));
    }

    #[test]
    fn test_no_new_never_reads() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut set = fileset(dir.path(), Strategy::NoNew);
        assert!(!set.has_file_changed("a.csv"));
        let diff = set.new_readings_from(&set.all_files().to_vec()).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_station_info_falls_back_to_id() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.csv", &[("2024-01-01 22:00:00", "19.5")]);
        let mut set = fileset(dir.path(), Strategy::Distrusting);
        assert_eq!(set.station_info(), StationInfo::named("test"));

        fs::write(
            dir.path().join(".info"),
            "Name: Hilltop\nLatitude: 45.5\nLongitude: -73.6\n",
        )
        .unwrap();
        // Cached after the first call.
        assert_eq!(set.station_info().name, "test");
        let mut fresh = fileset(dir.path(), Strategy::Distrusting);
        assert_eq!(fresh.station_info().name, "Hilltop");
    }
}
