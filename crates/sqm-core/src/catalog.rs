//! Discovery and access of data files under a station directory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use time::PrimitiveDateTime;
use tracing::{debug, warn};

use sqm_types::{RawReadings, StationInfo, parse_datetime, parse_utc_offset};

use crate::error::{Error, Result};
use crate::parser::DataFile;

/// Name of the optional station description file.
pub const DOT_INFO: &str = ".info";

/// Station id used when the data root itself holds data files.
pub const ROOT_STATION: &str = ".";

/// The data files of one station.
///
/// Files are identified by their path relative to the station directory,
/// always with `/` separators.
#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a relative file identifier.
    pub fn path_of(&self, file: &str) -> PathBuf {
        file.split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Every valid data file, sorted.
    ///
    /// Dotfiles and dot-directories are skipped; files that do not parse are
    /// logged and left out.
    pub fn scan(&self) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(&self.root, "", &mut files);
        files.retain(|file| match DataFile::open(self.path_of(file)) {
            Ok(_) => true,
            Err(e) => {
                debug!("Skipping {}: {}", file, e);
                false
            }
        });
        files.sort();
        files
    }

    pub fn exists(&self, file: &str) -> bool {
        self.path_of(file).is_file()
    }

    pub fn modified(&self, file: &str) -> Option<SystemTime> {
        fs::metadata(self.path_of(file))
            .and_then(|m| m.modified())
            .ok()
    }

    pub fn open(&self, file: &str) -> Result<DataFile> {
        DataFile::open(self.path_of(file))
    }

    /// All readings in `file`.
    pub fn readings_from(&self, file: &str) -> Result<RawReadings> {
        self.open(file)?.readings_from()
    }

    pub fn first_reading(&self, file: &str) -> Result<(String, String)> {
        Ok(self.open(file)?.first_reading())
    }

    pub fn last_reading(&self, file: &str) -> Result<Option<(String, String)>> {
        self.open(file)?.last_reading()
    }

    /// Station details embedded in `file`, if any.
    pub fn station_info_from(&self, file: &str) -> Option<StationInfo> {
        match self.open(file) {
            Ok(data) => data.station_info(),
            Err(e) => {
                debug!("No station info from {}: {}", file, e);
                None
            }
        }
    }

    /// Station details from the `.info` file.
    ///
    /// Lines are `Name: `, `Latitude: `, `Longitude: `, `Elevation: ` and
    /// `Timezone: `. Returns `None` unless name, latitude and longitude are
    /// all present.
    pub fn station_info_from_dot_info(&self) -> Option<StationInfo> {
        let content = fs::read_to_string(self.root.join(DOT_INFO)).ok()?;
        let mut name = None;
        let mut latitude = None;
        let mut longitude = None;
        let mut elevation = None;
        let mut utc_offset = None;

        for line in content.lines() {
            let line = line.trim_end();
            if let Some(value) = line.strip_prefix("Name: ") {
                name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Latitude: ") {
                latitude = value.trim().parse::<f64>().ok();
            } else if let Some(value) = line.strip_prefix("Longitude: ") {
                longitude = value.trim().parse::<f64>().ok();
            } else if let Some(value) = line.strip_prefix("Elevation: ") {
                elevation = value.trim().parse::<f64>().ok();
            } else if let Some(value) = line.strip_prefix("Timezone: ") {
                match parse_utc_offset(value) {
                    Ok(offset) => utc_offset = Some(offset),
                    Err(e) => warn!("Ignoring timezone in {}: {}", self.root.display(), e),
                }
            }
        }

        Some(StationInfo {
            name: name?,
            latitude: Some(latitude?),
            longitude: Some(longitude?),
            elevation,
            utc_offset,
        })
    }
}

fn collect_files(dir: &Path, prefix: &str, out: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read directory {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, &relative, out);
        } else {
            out.push(relative);
        }
    }
}

/// Station ids available under `data_root`.
///
/// If the root itself contains a valid data file it is the only station,
/// [`ROOT_STATION`]; otherwise every non-dot subdirectory is a station.
pub fn discover_stations<P: AsRef<Path>>(data_root: P) -> Result<Vec<String>> {
    let data_root = data_root.as_ref();
    if !data_root.is_dir() {
        return Err(Error::DataDirectory(data_root.to_path_buf()));
    }

    let mut files = Vec::new();
    let mut directories = Vec::new();
    for entry in fs::read_dir(data_root).map_err(|e| Error::io(data_root, e))? {
        let entry = entry.map_err(|e| Error::io(data_root, e))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            directories.push(name);
        } else {
            files.push(entry.path());
        }
    }

    if files.iter().any(|path| DataFile::is_valid(path)) {
        return Ok(vec![ROOT_STATION.to_string()]);
    }
    directories.sort();
    Ok(directories)
}

/// Original data rows for the files most recently asked about.
///
/// Rows are kept per file together with the file's modification time, so a
/// refresh re-reads only files that changed.
#[derive(Debug)]
pub struct RawRowIndex {
    catalog: Catalog,
    files: BTreeMap<String, IndexedFile>,
}

#[derive(Debug)]
struct IndexedFile {
    modified: Option<SystemTime>,
    rows: HashMap<PrimitiveDateTime, BTreeMap<String, String>>,
}

impl RawRowIndex {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            files: BTreeMap::new(),
        }
    }

    /// Index exactly `files`, re-reading those modified since last time.
    pub fn refresh(&mut self, files: &[String]) {
        self.files.retain(|file, _| files.contains(file));
        for file in files {
            let modified = self.catalog.modified(file);
            if let Some(indexed) = self.files.get(file) {
                if indexed.modified == modified {
                    continue;
                }
            }
            match self.catalog.open(file).and_then(DataFile::into_rows) {
                Ok(rows) => {
                    let rows = rows
                        .into_iter()
                        .filter_map(|row| {
                            parse_datetime(&row.datetime)
                                .ok()
                                .map(|datetime| (datetime, row.fields))
                        })
                        .collect();
                    self.files
                        .insert(file.clone(), IndexedFile { modified, rows });
                }
                Err(e) => {
                    debug!("Could not index rows of {}: {}", file, e);
                    self.files.remove(file);
                }
            }
        }
    }

    /// The row recorded at `datetime`, merged across files.
    ///
    /// Fields from later files override those from earlier ones.
    pub fn row(&self, datetime: PrimitiveDateTime) -> Option<BTreeMap<String, String>> {
        let mut merged: Option<BTreeMap<String, String>> = None;
        for indexed in self.files.values() {
            if let Some(fields) = indexed.rows.get(&datetime) {
                merged
                    .get_or_insert_with(BTreeMap::new)
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    const VALID: &str = "Local Date, Local Time, MSAS\n2024-01-01, 21:00:00, 20.10\n";

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_scan_recurses_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "2024/2024-02.csv", VALID);
        write(dir.path(), "2024/2024-01.csv", VALID);
        write(dir.path(), "top.csv", VALID);
        write(dir.path(), "notes.txt", "nothing here\n");
        write(dir.path(), ".hidden.csv", VALID);
        write(dir.path(), ".trash/old.csv", VALID);

        let catalog = Catalog::new(dir.path());
        assert_eq!(
            catalog.scan(),
            vec!["2024/2024-01.csv", "2024/2024-02.csv", "top.csv"]
        );
        assert!(catalog.exists("2024/2024-01.csv"));
        assert!(catalog.modified("2024/2024-01.csv").is_some());
        assert!(!catalog.exists("missing.csv"));
    }

    #[test]
    fn test_readings_and_extremes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            "Local Date, Local Time, MSAS\n\
             2024-01-01, 21:00:00, 20.10\n\
             2024-01-01, 22:00:00, 20.20\n",
        );
        let catalog = Catalog::new(dir.path());
        assert_eq!(catalog.readings_from("a.csv").unwrap().len(), 2);
        assert_eq!(catalog.first_reading("a.csv").unwrap().0, "2024-01-01 21:00:00");
        assert_eq!(
            catalog.last_reading("a.csv").unwrap().unwrap().0,
            "2024-01-01 22:00:00"
        );
    }

    #[test]
    fn test_dot_info() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            DOT_INFO,
            "Name: Ridge Station\nLatitude: 40.5\nLongitude: -111.25\nElevation: 2100\nTimezone: -07:00\n",
        );
        let info = Catalog::new(dir.path()).station_info_from_dot_info().unwrap();
        assert_eq!(info.name, "Ridge Station");
        assert_eq!(info.latitude, Some(40.5));
        assert_eq!(info.longitude, Some(-111.25));
        assert_eq!(info.elevation, Some(2100.0));
        assert_eq!(info.utc_offset, Some(offset!(-7)));
    }

    #[test]
    fn test_dot_info_requires_position() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), DOT_INFO, "Name: Nowhere\nTimezone: Mars/Olympus\n");
        assert!(Catalog::new(dir.path()).station_info_from_dot_info().is_none());
    }

    #[test]
    fn test_discover_stations_root() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data.csv", VALID);
        write(dir.path(), "sub/data.csv", VALID);
        assert_eq!(discover_stations(dir.path()).unwrap(), vec![ROOT_STATION]);
    }

    #[test]
    fn test_discover_stations_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "beta/data.csv", VALID);
        write(dir.path(), "alpha/data.csv", VALID);
        write(dir.path(), ".cache/x", "");
        write(dir.path(), "README", "about these stations\n");
        assert_eq!(discover_stations(dir.path()).unwrap(), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_discover_stations_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_stations(dir.path().join("nope")),
            Err(Error::DataDirectory(_))
        ));
    }

    #[test]
    fn test_raw_row_index_merges_files() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.csv",
            "Local Date, Local Time, Temperature, MSAS\n2024-01-01, 21:00:00, 4.0, 20.10\n",
        );
        write(
            dir.path(),
            "b.csv",
            "Local Date, Local Time, Voltage, MSAS\n2024-01-01, 21:00:00, 3.3, 20.10\n",
        );
        let mut index = RawRowIndex::new(Catalog::new(dir.path()));
        index.refresh(&["a.csv".to_string(), "b.csv".to_string()]);

        let row = index.row(datetime!(2024-01-01 21:00)).unwrap();
        assert_eq!(row["Temperature"], "4.0");
        assert_eq!(row["Voltage"], "3.3");
        assert!(index.row(datetime!(2024-01-01 22:00)).is_none());

        index.refresh(&["b.csv".to_string()]);
        let row = index.row(datetime!(2024-01-01 21:00)).unwrap();
        assert!(!row.contains_key("Temperature"));
    }
}
