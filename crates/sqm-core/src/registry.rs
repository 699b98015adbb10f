//! Composition root: turns a [`Config`] into per-station dataset managers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{error, info, warn};

use sqm_store::{
    CacheRoot, DiskPartitions, DiskRollups, DiskSnapshots, MemoryPartitions, MemoryRollups,
    MemorySnapshots, PartitionStore, RollupStore, SnapshotStore, partitions_cache_id,
    rollups_cache_id, snapshots_cache_id,
};
use sqm_types::StationInfo;

use crate::attributes::{
    AttributePipeline, CloudRegression, RawColumns, SunMoon, SunMoonCloudsFilter,
};
use crate::catalog::{Catalog, ROOT_STATION, discover_stations};
use crate::config::{Config, Features};
use crate::ephemeris::{Ephemeris, FixedNight};
use crate::error::{Error, Result};
use crate::fileset::{Fileset, Strategy};
use crate::manager::DatasetManager;

/// Builds the geometry provider for a station.
pub type EphemerisFactory = Box<dyn Fn(&StationInfo) -> Box<dyn Ephemeris>>;

/// Every station under the data root, with shared cache access.
///
/// Managers are built on first use and kept for the life of the registry.
pub struct StationRegistry {
    config: Config,
    features: Features,
    cache: Option<CacheRoot>,
    ephemeris: EphemerisFactory,
    strategy: Option<Strategy>,
    managers: BTreeMap<String, DatasetManager>,
}

impl std::fmt::Debug for StationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationRegistry")
            .field("features", &self.features)
            .field("cache", &self.cache)
            .field("stations", &self.managers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl StationRegistry {
    /// Validate `config` and open the cache, if one is configured.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let cache = config.cache.directory.as_ref().map(|directory| {
            CacheRoot::initialize(directory, config.cache.block, config.cache.read_only)
        });
        let features = config.resolve(cache.is_some());
        info!(
            "Data in {}, caching {}",
            config.data.directory.display(),
            match &cache {
                Some(root) if root.is_read_only() => "read-only",
                Some(_) => "enabled",
                None => "disabled",
            }
        );
        Ok(Self {
            config,
            features,
            cache,
            ephemeris: Box::new(|_| Box::new(FixedNight)),
            strategy: None,
            managers: BTreeMap::new(),
        })
    }

    /// Use `factory` for the sun and moon geometry of each station.
    #[must_use]
    pub fn with_ephemeris(
        mut self,
        factory: impl Fn(&StationInfo) -> Box<dyn Ephemeris> + 'static,
    ) -> Self {
        self.ephemeris = Box::new(factory);
        self
    }

    /// Override the configured file trust for writable processes.
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Returns true if a cache is configured but this process may not write it.
    pub fn is_read_only(&self) -> bool {
        self.cache.as_ref().is_some_and(CacheRoot::is_read_only)
    }

    /// Station ids under the data root.
    pub fn stations(&self) -> Result<Vec<String>> {
        discover_stations(&self.config.data.directory)
    }

    fn station_dir(&self, station: &str) -> PathBuf {
        if station == ROOT_STATION {
            self.config.data.directory.clone()
        } else {
            self.config.data.directory.join(station)
        }
    }

    fn strategy(&self) -> Strategy {
        if self.is_read_only() {
            return Strategy::NoNew;
        }
        match self.strategy {
            Some(strategy) => strategy,
            None if self.features.trust_files => Strategy::Trusting,
            None => Strategy::Distrusting,
        }
    }

    /// The manager for `station`, built on first use.
    pub fn manager(&mut self, station: &str) -> Result<&mut DatasetManager> {
        if !self.managers.contains_key(station) {
            if !self.stations()?.iter().any(|s| s == station) {
                return Err(Error::UnknownStation(station.to_string()));
            }
            let manager = self.build(station);
            self.managers.insert(station.to_string(), manager);
        }
        self.managers
            .get_mut(station)
            .ok_or_else(|| Error::UnknownStation(station.to_string()))
    }

    fn build(&self, station: &str) -> DatasetManager {
        let catalog = Catalog::new(self.station_dir(station));
        let (snapshots, partitions, rollups): (
            Box<dyn SnapshotStore>,
            Box<dyn PartitionStore>,
            Box<dyn RollupStore>,
        ) = match &self.cache {
            Some(root) => (
                Box::new(DiskSnapshots::new(root.create(&snapshots_cache_id(station)))),
                Box::new(DiskPartitions::new(root.create(&partitions_cache_id(station)))),
                Box::new(DiskRollups::new(root.create(&rollups_cache_id(station)))),
            ),
            None => (
                Box::new(MemorySnapshots::new()),
                Box::new(MemoryPartitions::new()),
                Box::new(MemoryRollups::new()),
            ),
        };

        let mut fileset = Fileset::new(station, catalog, snapshots, self.strategy());
        let info = fileset.station_info();
        let pipeline = self.pipeline((self.ephemeris)(&info));

        let manager = DatasetManager::new(fileset, partitions, rollups, pipeline)
            .with_default_twilight(self.config.attributes.default_twilight);
        if self.features.raw_data {
            manager.with_raw_rows()
        } else {
            manager
        }
    }

    fn pipeline(&self, ephemeris: Box<dyn Ephemeris>) -> AttributePipeline {
        let mut pipeline = AttributePipeline::new(ephemeris);
        if self.features.sun_moon {
            pipeline = pipeline.with_module(SunMoon);
        }
        if self.features.regression {
            pipeline = pipeline.with_module(CloudRegression {
                window: self.config.regression.window(),
                mean_r_squared_threshold: self.config.filter.mean_r_squared,
            });
        }
        if self.features.raw_data {
            pipeline = pipeline.with_module(RawColumns);
        }
        if self.features.sun_moon_clouds_filter {
            pipeline = pipeline.with_module(SunMoonCloudsFilter {
                thresholds: self.config.filter.thresholds(),
            });
        }
        pipeline
    }

    /// Pass `result` through, turning faults into [`Error::Internal`].
    ///
    /// Errors that are not [`Error::is_fault`], such as an unknown station,
    /// are returned unchanged. A fault is logged, every manager is dropped
    /// and, when so configured, the cache is wiped.
    pub fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        let e = match result {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_fault() => return Err(e),
            Err(e) => e,
        };
        error!("Request failed: {}", e);
        self.managers.clear();
        if self.config.cache.clear_on_errors
            && let Err(clear) = self.clear_cache()
        {
            warn!("Could not clear cache after error: {}", clear);
        }
        Err(Error::Internal)
    }

    /// Delete every cached station. A no-op without write access.
    pub fn clear_cache(&mut self) -> Result<()> {
        self.managers.clear();
        match &self.cache {
            Some(root) => Ok(root.clear()?),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::config::Toggle;

    const VALID: &str = "Local Date, Local Time, MSAS\n2024-01-01, 22:00:00, 20.10\n";

    fn config(data: &std::path::Path, cache: Option<&std::path::Path>) -> Config {
        let mut config = Config::default();
        config.data.directory = data.to_path_buf();
        config.cache.directory = cache.map(|p| p.to_path_buf());
        config
    }

    #[test]
    fn test_unknown_station() {
        let data = tempfile::tempdir().unwrap();
        fs::create_dir(data.path().join("hilltop")).unwrap();
        let mut registry = StationRegistry::new(config(data.path(), None)).unwrap();
        assert_eq!(registry.stations().unwrap(), vec!["hilltop".to_string()]);
        assert!(matches!(
            registry.manager("../etc"),
            Err(Error::UnknownStation(_))
        ));
    }

    #[test]
    fn test_root_station() {
        let data = tempfile::tempdir().unwrap();
        fs::write(data.path().join("2024-01.csv"), VALID).unwrap();
        let mut registry = StationRegistry::new(config(data.path(), None)).unwrap();
        assert_eq!(registry.stations().unwrap(), vec![ROOT_STATION.to_string()]);
        let manager = registry.manager(ROOT_STATION).unwrap();
        assert_eq!(manager.fileset().strategy(), Strategy::Trusting);
        assert_eq!(manager.station_info().name, ROOT_STATION);
    }

    #[test]
    fn test_strategy_follows_cache() {
        let data = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::create_dir(data.path().join("s")).unwrap();
        fs::write(data.path().join("s").join("2024-01.csv"), VALID).unwrap();

        let mut writer = StationRegistry::new(config(data.path(), Some(cache.path()))).unwrap();
        assert!(!writer.is_read_only());
        assert_eq!(
            writer.manager("s").unwrap().fileset().strategy(),
            Strategy::Distrusting
        );

        let mut reader = StationRegistry::new(config(data.path(), Some(cache.path()))).unwrap();
        assert!(reader.is_read_only());
        assert_eq!(
            reader.manager("s").unwrap().fileset().strategy(),
            Strategy::NoNew
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.filter.moon_illumination = 2.0;
        assert!(matches!(
            StationRegistry::new(config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_guard_passes_request_errors_through() {
        let data = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        fs::create_dir(data.path().join("s")).unwrap();
        fs::write(data.path().join("s").join("2024-01.csv"), VALID).unwrap();
        let mut registry = StationRegistry::new(config(data.path(), Some(cache.path()))).unwrap();
        registry.manager("s").unwrap().refresh_all().unwrap();
        let best = cache.path().join("s_best").join("best");
        assert!(best.is_file());

        let result = registry.manager("typo").map(|_| ());
        let guarded = registry.guard(result).unwrap_err();
        assert!(matches!(guarded, Error::UnknownStation(_)));
        assert!(best.is_file());
    }

    #[test]
    fn test_guard_hides_faults_and_clears() {
        let data = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let mut registry = StationRegistry::new(config(data.path(), Some(cache.path()))).unwrap();
        fs::create_dir(cache.path().join("leftover")).unwrap();

        let fault = sqm_store::Error::Io(std::io::Error::other("secret"));
        let result: Result<()> = Err(Error::Store(fault));
        let guarded = registry.guard(result).unwrap_err();
        assert!(matches!(guarded, Error::Internal));
        assert!(!guarded.to_string().contains("secret"));
        assert!(!cache.path().join("leftover").exists());
        assert!(cache.path().join(sqm_store::LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_pipeline_follows_features() {
        let data = tempfile::tempdir().unwrap();
        let mut config = config(data.path(), None);
        config.attributes.sun_moon = Toggle::Always;
        config.attributes.regression = Toggle::Always;
        let registry = StationRegistry::new(config).unwrap();
        let names = registry.pipeline(Box::new(FixedNight)).module_names();
        assert_eq!(
            names,
            vec![
                "reading_count",
                "sun_moon",
                "cloud_regression",
                "sun_moon_clouds_filter"
            ]
        );
    }
}
