//! Per-file snapshots of the readings last seen in each source file.

use std::collections::HashMap;
use std::time::SystemTime;

use sqm_types::RawReadings;

use crate::cache::Cache;
use crate::error::Result;

/// Remembers, for each source file, the readings it held and when it was read.
pub trait SnapshotStore {
    /// Readings last recorded for `file`; empty if the file was never seen.
    fn readings(&self, file: &str) -> RawReadings;

    /// Replace the readings recorded for `file`.
    fn set_readings(&mut self, file: &str, readings: &RawReadings) -> Result<()>;

    /// When `file` was last loaded; `None` means never.
    fn load_time(&self, file: &str) -> Option<SystemTime>;

    /// Record when `file` was loaded.
    fn set_load_time(&mut self, file: &str, time: SystemTime);

    /// Files that appeared since the last scan.
    fn new_files(&mut self, _files: &[String]) -> Result<()> {
        Ok(())
    }

    /// Files that disappeared since the last scan; their snapshots are dropped.
    fn deleted_files(&mut self, files: &[String]) -> Result<()>;

    /// Every file that currently has a snapshot, sorted.
    fn known_files(&self) -> Vec<String>;
}

/// Snapshots kept for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemorySnapshots {
    readings: HashMap<String, RawReadings>,
    load_times: HashMap<String, SystemTime>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshots {
    fn readings(&self, file: &str) -> RawReadings {
        self.readings.get(file).cloned().unwrap_or_default()
    }

    fn set_readings(&mut self, file: &str, readings: &RawReadings) -> Result<()> {
        self.readings.insert(file.to_string(), readings.clone());
        Ok(())
    }

    fn load_time(&self, file: &str) -> Option<SystemTime> {
        self.load_times.get(file).copied()
    }

    fn set_load_time(&mut self, file: &str, time: SystemTime) {
        self.load_times.insert(file.to_string(), time);
    }

    fn deleted_files(&mut self, files: &[String]) -> Result<()> {
        for file in files {
            self.readings.remove(file);
            self.load_times.remove(file);
        }
        Ok(())
    }

    fn known_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.readings.keys().cloned().collect();
        files.sort();
        files
    }
}

/// Snapshots persisted as one cache blob per source file.
///
/// The load time of a file is the modification time of its blob, so
/// [`SnapshotStore::set_load_time`] has nothing to record.
#[derive(Debug, Clone)]
pub struct DiskSnapshots {
    cache: Cache,
}

impl DiskSnapshots {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

impl SnapshotStore for DiskSnapshots {
    fn readings(&self, file: &str) -> RawReadings {
        self.cache.load(file).unwrap_or_default()
    }

    fn set_readings(&mut self, file: &str, readings: &RawReadings) -> Result<()> {
        self.cache.save(file, readings)
    }

    fn load_time(&self, file: &str) -> Option<SystemTime> {
        self.cache.modified(file)
    }

    fn set_load_time(&mut self, _file: &str, _time: SystemTime) {}

    fn deleted_files(&mut self, files: &[String]) -> Result<()> {
        for file in files {
            self.cache.remove(file)?;
        }
        Ok(())
    }

    fn known_files(&self) -> Vec<String> {
        let mut files = self.cache.keys();
        files.sort();
        files
    }
}
