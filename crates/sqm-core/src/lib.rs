//! Incremental synchronization of SQM photometer data files into a cache.
//!
//! A Sky Quality Meter logs night-sky brightness readings into delimited text
//! files. This crate keeps a derived dataset of those readings in step with the
//! files, re-reading only what changed:
//!
//! - **Discovery**: [`catalog`] finds stations and data files, [`parser`] reads them
//! - **Reconciliation**: a [`Fileset`] diffs changed files against per-file
//!   snapshots and reports readings added and removed
//! - **Storage**: readings are grouped into noon-to-noon nights with a best
//!   reading per night (see `sqm-store`)
//! - **Enrichment**: an [`AttributePipeline`] adds sun and moon geometry, a
//!   cloud indicator and the original data row to each reading
//! - **Queries**: a [`DatasetManager`] answers range, daily, nightly and
//!   best-of-night queries for one station
//!
//! [`StationRegistry`] wires all of this together from a [`Config`].
//!
//! # Quick Start
//!
//! ```no_run
//! use sqm_core::{Config, StationRegistry};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.data.directory = "/srv/sqm/data".into();
//!
//!     let mut registry = StationRegistry::new(config)?;
//!     for station in registry.stations()? {
//!         let manager = registry.manager(&station)?;
//!         let range = manager.readings_range()?;
//!         println!("{}: {:?} to {:?}", station, range.earliest, range.latest);
//!     }
//!     Ok(())
//! }
//! ```

pub mod attributes;
pub mod catalog;
pub mod config;
pub mod ephemeris;
pub mod error;
pub mod fileset;
pub mod manager;
pub mod parser;
pub mod registry;
pub mod regression;

pub use attributes::{
    AttributeModule, AttributePipeline, CloudRegression, FilterThresholds, NightContext,
    RawColumns, RawRowLookup, ReadingCount, SunMoon, SunMoonCloudsFilter,
};
pub use catalog::{Catalog, DOT_INFO, ROOT_STATION, RawRowIndex, discover_stations};
pub use config::{Config, ConfigError, Features, Toggle, ValidationError, default_config_path};
pub use ephemeris::{Ephemeris, FixedNight};
pub use error::{Error, Result};
pub use fileset::{Fileset, Strategy};
pub use manager::DatasetManager;
pub use parser::{DataFile, RawRow};
pub use registry::{EphemerisFactory, StationRegistry};
pub use regression::{RegressionResult, RegressionWindow};
