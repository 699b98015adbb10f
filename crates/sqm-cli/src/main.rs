//! SQM - cache maintenance and queries for SQM photometer data.
//!
//! Run with: `cargo run -p sqm-cli -- update-cache`

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use sqm_core::{Config, DatasetManager, StationRegistry, Strategy};
use sqm_types::{ReadingsRange, StationInfo, TwilightType, parse_date};

/// SQM - keep the reading cache in step with the data files.
#[derive(Parser, Debug)]
#[command(name = "sqm")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory (overrides config).
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Cache directory (overrides config).
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read every data file and bring the cache up to date.
    UpdateCache {
        /// Only update this station.
        #[arg(long)]
        station: Option<String>,
    },

    /// Delete everything in the cache.
    ClearCache,

    /// Print the earliest and latest readings of a station.
    Range {
        #[arg(long)]
        station: String,
    },

    /// Print the best reading of each night.
    Best {
        #[arg(long)]
        station: String,
        /// First night, YYYY-MM-DD.
        #[arg(long)]
        start: Option<String>,
        /// Last night, YYYY-MM-DD.
        #[arg(long)]
        end: Option<String>,
    },

    /// Print the readings between sunset and sunrise of one night.
    Night {
        #[arg(long)]
        station: String,
        /// Night, YYYY-MM-DD.
        #[arg(long)]
        date: String,
        /// civil, nautical, astronomical or night.
        #[arg(long)]
        twilight: Option<TwilightType>,
    },
}

#[derive(Serialize)]
struct StationSummary {
    station: String,
    info: StationInfo,
    range: ReadingsRange,
    nights: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("sqm=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data.directory = data_dir;
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache.directory = Some(cache_dir);
    }

    match args.command {
        Command::UpdateCache { station } => update_cache(config, station),
        Command::ClearCache => clear_cache(config),
        Command::Range { station } => {
            let mut registry = StationRegistry::new(config)?;
            print_json(&query(&mut registry, &station, |manager| {
                manager.readings_range()
            })?)
        }
        Command::Best {
            station,
            start,
            end,
        } => {
            let start = start.as_deref().map(parse_date).transpose()?;
            let end = end.as_deref().map(parse_date).transpose()?;
            let mut registry = StationRegistry::new(config)?;
            print_json(&query(&mut registry, &station, |manager| {
                manager.best_nightly_readings(start, end)
            })?)
        }
        Command::Night {
            station,
            date,
            twilight,
        } => {
            let date = parse_date(&date)?;
            let mut registry = StationRegistry::new(config)?;
            print_json(&query(&mut registry, &station, |manager| {
                manager.nightly_readings(date, twilight)
            })?)
        }
    }
}

/// Run `f` on the manager of `station`, wiping the cache on faults.
fn query<T>(
    registry: &mut StationRegistry,
    station: &str,
    f: impl FnOnce(&mut DatasetManager) -> sqm_core::Result<T>,
) -> anyhow::Result<T> {
    let result = registry.manager(station).and_then(f);
    Ok(registry.guard(result)?)
}

fn update_cache(mut config: Config, only: Option<String>) -> anyhow::Result<()> {
    if config.cache.directory.is_none() {
        bail!("No cache directory configured; pass --cache-dir or set [cache] directory");
    }
    config.cache.block = true;
    config.cache.read_only = false;

    let mut registry = StationRegistry::new(config)?.with_strategy(Strategy::Distrusting);
    let stations = match only {
        Some(station) => vec![station],
        None => registry.stations()?,
    };

    let mut summaries = Vec::new();
    for station in stations {
        info!("Updating cache for {}", station);
        let result = summarize(&mut registry, &station);
        let summary = registry
            .guard(result)
            .with_context(|| format!("Failed to update station {}", station))?;
        summaries.push(summary);
    }
    print_json(&summaries)
}

fn summarize(registry: &mut StationRegistry, station: &str) -> sqm_core::Result<StationSummary> {
    let manager = registry.manager(station)?;
    let info = manager.station_info().clone();
    let range = manager.readings_range()?;
    let nights = manager.best_nightly_readings(None, None)?.len();
    Ok(StationSummary {
        station: station.to_string(),
        info,
        range,
        nights,
    })
}

fn clear_cache(mut config: Config) -> anyhow::Result<()> {
    let Some(directory) = config.cache.directory.clone() else {
        bail!("No cache directory configured; pass --cache-dir or set [cache] directory");
    };
    config.cache.block = true;
    config.cache.read_only = false;

    let mut registry = StationRegistry::new(config)?;
    registry.clear_cache()?;
    println!("Cleared cache at {}", directory.display());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
