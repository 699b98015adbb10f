//! Date-partitioned reading storage.
//!
//! Readings are grouped by night (see [`sqm_types::night_of`]). Each partition
//! keeps three index-aligned arrays (datetimes, values and attributes) sorted
//! ascending by datetime.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{Date, PrimitiveDateTime};
use tracing::debug;

use sqm_types::{AnnotatedReading, Attributes, RawReadings, Reading, format_date, parse_date};

use crate::cache::Cache;
use crate::error::Result;

/// The readings of one night.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    #[serde(with = "sqm_types::datetime::as_datetime_seq")]
    pub datetimes: Vec<PrimitiveDateTime>,
    pub values: Vec<f64>,
    #[serde(default)]
    pub attributes: Vec<Attributes>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.datetimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datetimes.is_empty()
    }

    /// Append a reading with no attributes yet.
    pub fn push(&mut self, reading: Reading) {
        self.datetimes.push(reading.datetime);
        self.values.push(reading.value);
        self.attributes.push(Attributes::new());
    }

    /// Delete the point at `index` from all three arrays.
    fn remove_at(&mut self, index: usize) {
        self.datetimes.remove(index);
        self.values.remove(index);
        if index < self.attributes.len() {
            self.attributes.remove(index);
        }
    }

    /// Restore the partition invariants.
    ///
    /// Values are truncated to the datetime count, missing attributes become
    /// empty maps, and all three arrays are stably sorted by datetime together.
    pub fn normalize(&mut self) {
        let len = self.datetimes.len().min(self.values.len());
        self.datetimes.truncate(len);
        self.values.truncate(len);
        self.attributes.resize_with(len, Attributes::new);

        if self.datetimes.windows(2).all(|w| w[0] <= w[1]) {
            return;
        }

        let mut order: Vec<usize> = (0..len).collect();
        order.sort_by_key(|&i| self.datetimes[i]);
        let mut attributes: Vec<Option<Attributes>> =
            std::mem::take(&mut self.attributes).into_iter().map(Some).collect();
        self.datetimes = order.iter().map(|&i| self.datetimes[i]).collect();
        self.values = order.iter().map(|&i| self.values[i]).collect();
        self.attributes = order
            .iter()
            .map(|&i| attributes[i].take().unwrap_or_default())
            .collect();
    }

    /// Readings in datetime order.
    pub fn readings(&self) -> impl Iterator<Item = Reading> + '_ {
        self.datetimes
            .iter()
            .zip(&self.values)
            .map(|(dt, value)| Reading::new(*dt, *value))
    }

    /// Readings paired with their attributes.
    pub fn annotated(&self) -> Vec<AnnotatedReading> {
        self.readings()
            .enumerate()
            .map(|(i, reading)| AnnotatedReading {
                datetime: reading.datetime,
                value: reading.value,
                attributes: self.attributes.get(i).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Index and value of the brightest reading; the first one wins ties.
    pub fn best(&self) -> Option<(usize, Reading)> {
        let mut best: Option<(usize, Reading)> = None;
        for (i, reading) in self.readings().enumerate() {
            match best {
                Some((_, current)) if reading.value <= current.value => {}
                _ => best = Some((i, reading)),
            }
        }
        best
    }

    fn contains(&self, reading: &Reading) -> bool {
        self.readings().any(|r| r.identity() == reading.identity())
    }

    fn position_of(&self, reading: &Reading) -> Option<usize> {
        self.readings()
            .position(|r| r.identity() == reading.identity())
            .or_else(|| self.datetimes.iter().position(|dt| *dt == reading.datetime))
    }
}

/// Storage for night partitions.
///
/// Implementors supply the four primitive operations; merging and removing
/// reading sets is shared.
pub trait PartitionStore {
    /// Every night that has at least one reading.
    fn dates(&self) -> BTreeSet<Date>;

    /// The partition for `date`, empty if absent.
    ///
    /// With `with_attributes` false the attribute array is left empty.
    fn partition(&self, date: Date, with_attributes: bool) -> Partition;

    /// Replace the partition for `date`. An empty partition deletes the night.
    fn set_partition(&mut self, date: Date, partition: Partition) -> Result<()>;

    /// Replace the attributes of `date`, aligned with its current readings.
    fn set_attributes(&mut self, date: Date, attributes: Vec<Attributes>) -> Result<()> {
        let mut partition = self.partition(date, false);
        if partition.is_empty() {
            return Ok(());
        }
        partition.attributes = attributes;
        self.set_partition(date, partition)
    }

    /// Merge `other` into this store and return the nights that changed.
    ///
    /// A reading already present with the same datetime and value is not
    /// stored twice.
    fn add(&mut self, other: &MemoryPartitions) -> Result<BTreeSet<Date>> {
        let existing = self.dates();
        let mut touched = BTreeSet::new();
        for (date, incoming) in other.iter() {
            if !existing.contains(date) {
                let mut partition = incoming.clone();
                partition.normalize();
                if !partition.is_empty() {
                    self.set_partition(*date, partition)?;
                    touched.insert(*date);
                }
                continue;
            }

            let mut current = self.partition(*date, true);
            let mut changed = false;
            for reading in incoming.readings() {
                if !current.contains(&reading) {
                    current.push(reading);
                    changed = true;
                }
            }
            if changed {
                self.set_partition(*date, current)?;
                touched.insert(*date);
            }
        }
        Ok(touched)
    }

    /// Remove the readings of `other` and return the nights that changed.
    ///
    /// Each reading removes one stored point with the same datetime, preferring
    /// one that also has the same value.
    fn remove(&mut self, other: &MemoryPartitions) -> Result<BTreeSet<Date>> {
        let existing = self.dates();
        let mut touched = BTreeSet::new();
        for (date, outgoing) in other.iter() {
            if !existing.contains(date) {
                continue;
            }
            let mut current = self.partition(*date, true);
            let mut changed = false;
            for reading in outgoing.readings() {
                if let Some(index) = current.position_of(&reading) {
                    current.remove_at(index);
                    changed = true;
                }
            }
            if changed {
                self.set_partition(*date, current)?;
                touched.insert(*date);
            }
        }
        Ok(touched)
    }

    /// The earliest stored reading.
    fn earliest(&self) -> Option<Reading> {
        let date = self.dates().into_iter().next()?;
        self.partition(date, false).readings().next()
    }

    /// The latest stored reading.
    fn latest(&self) -> Option<Reading> {
        let date = self.dates().into_iter().next_back()?;
        self.partition(date, false).readings().last()
    }
}

/// Partitions held in memory.
///
/// Also the carrier for freshly parsed readings on their way into a store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryPartitions {
    partitions: BTreeMap<Date, Partition>,
}

impl MemoryPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group file readings by night.
    ///
    /// Entries whose datetime or value cannot be parsed are skipped.
    pub fn from_raw(raw: &RawReadings) -> Self {
        Self::from_pairs(raw.iter().map(|(d, v)| (d.as_str(), v.as_str())))
    }

    /// Group `(datetime, value)` string pairs by night.
    ///
    /// Pairs that parse to the same reading are kept once, and unparseable
    /// pairs are skipped.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut result = Self::new();
        for (datetime, value) in pairs {
            match Reading::from_raw(datetime, value) {
                Ok(reading) => {
                    let partition = result.partitions.entry(reading.night()).or_default();
                    if !partition.contains(&reading) {
                        partition.push(reading);
                    }
                }
                Err(e) => debug!("Skipping reading: {}", e),
            }
        }
        for partition in result.partitions.values_mut() {
            partition.normalize();
        }
        result
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Date, &Partition)> {
        self.partitions.iter()
    }
}

impl PartitionStore for MemoryPartitions {
    fn dates(&self) -> BTreeSet<Date> {
        self.partitions.keys().copied().collect()
    }

    fn partition(&self, date: Date, with_attributes: bool) -> Partition {
        let mut partition = self.partitions.get(&date).cloned().unwrap_or_default();
        if !with_attributes {
            partition.attributes.clear();
        }
        partition
    }

    fn set_partition(&mut self, date: Date, mut partition: Partition) -> Result<()> {
        partition.normalize();
        if partition.is_empty() {
            self.partitions.remove(&date);
        } else {
            self.partitions.insert(date, partition);
        }
        Ok(())
    }

    fn set_attributes(&mut self, date: Date, attributes: Vec<Attributes>) -> Result<()> {
        if let Some(partition) = self.partitions.get_mut(&date) {
            partition.attributes = attributes;
            partition.normalize();
        }
        Ok(())
    }
}

/// Partitions persisted as one cache blob per night.
#[derive(Debug, Clone)]
pub struct DiskPartitions {
    cache: Cache,
}

impl DiskPartitions {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

impl PartitionStore for DiskPartitions {
    fn dates(&self) -> BTreeSet<Date> {
        self.cache
            .keys()
            .iter()
            .filter_map(|key| parse_date(key).ok())
            .collect()
    }

    fn partition(&self, date: Date, with_attributes: bool) -> Partition {
        let mut partition: Partition = self.cache.load(&format_date(date)).unwrap_or_default();
        partition.normalize();
        if !with_attributes {
            partition.attributes.clear();
        }
        partition
    }

    fn set_partition(&mut self, date: Date, mut partition: Partition) -> Result<()> {
        partition.normalize();
        let key = format_date(date);
        if partition.is_empty() {
            self.cache.remove(&key)
        } else {
            self.cache.save(&key, &partition)
        }
    }
}
