//! Best-of-night rollup storage.

use std::collections::{BTreeMap, BTreeSet};

use time::Date;

use sqm_types::BestNightlyRecord;

use crate::cache::Cache;
use crate::error::Result;

const BEST_KEY: &str = "best";

/// One [`BestNightlyRecord`] per night that has readings.
pub trait RollupStore {
    /// Every record, ordered by date.
    fn all(&self) -> Vec<BestNightlyRecord>;

    /// Insert or replace records by date.
    fn set_many(&mut self, records: Vec<BestNightlyRecord>) -> Result<()>;

    /// Drop the records of nights that no longer have readings.
    fn remove_dates(&mut self, dates: &BTreeSet<Date>) -> Result<()>;

    /// Records with `start <= date <= end`.
    fn between(&self, start: Date, end: Date) -> Vec<BestNightlyRecord> {
        self.all()
            .into_iter()
            .filter(|record| start <= record.date && record.date <= end)
            .collect()
    }
}

/// Rollup records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRollups {
    records: BTreeMap<Date, BestNightlyRecord>,
}

impl MemoryRollups {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RollupStore for MemoryRollups {
    fn all(&self) -> Vec<BestNightlyRecord> {
        self.records.values().cloned().collect()
    }

    fn set_many(&mut self, records: Vec<BestNightlyRecord>) -> Result<()> {
        for record in records {
            self.records.insert(record.date, record);
        }
        Ok(())
    }

    fn remove_dates(&mut self, dates: &BTreeSet<Date>) -> Result<()> {
        for date in dates {
            self.records.remove(date);
        }
        Ok(())
    }
}

/// Rollup records persisted as a single cache blob.
#[derive(Debug, Clone)]
pub struct DiskRollups {
    cache: Cache,
}

impl DiskRollups {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }

    fn load(&self) -> BTreeMap<Date, BestNightlyRecord> {
        self.cache
            .load::<Vec<BestNightlyRecord>>(BEST_KEY)
            .unwrap_or_default()
            .into_iter()
            .map(|record| (record.date, record))
            .collect()
    }

    fn store(&self, records: BTreeMap<Date, BestNightlyRecord>) -> Result<()> {
        let records: Vec<_> = records.into_values().collect();
        self.cache.save(BEST_KEY, &records)
    }
}

impl RollupStore for DiskRollups {
    fn all(&self) -> Vec<BestNightlyRecord> {
        self.load().into_values().collect()
    }

    fn set_many(&mut self, records: Vec<BestNightlyRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut current = self.load();
        for record in records {
            current.insert(record.date, record);
        }
        self.store(current)
    }

    fn remove_dates(&mut self, dates: &BTreeSet<Date>) -> Result<()> {
        if dates.is_empty() {
            return Ok(());
        }
        let mut current = self.load();
        let before = current.len();
        current.retain(|date, _| !dates.contains(date));
        if current.len() == before {
            return Ok(());
        }
        self.store(current)
    }
}
