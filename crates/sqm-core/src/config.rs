//! Engine configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sqm_types::TwilightType;

use crate::attributes::FilterThresholds;
use crate::regression::RegressionWindow;

/// Engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the data files live.
    pub data: DataConfig,
    /// Cache settings; caching is off without a directory.
    pub cache: CacheConfig,
    /// File name assumptions.
    pub fileset: FilesetConfig,
    /// Which attribute modules run.
    pub attributes: AttributesConfig,
    /// Cloud regression windows.
    pub regression: RegressionConfig,
    /// Thresholds of the sun, moon and clouds filter.
    pub filter: FilterConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// ```
    /// use sqm_core::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.data.validate());
        errors.extend(self.cache.validate());
        errors.extend(self.regression.validate());
        errors.extend(self.filter.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Settle every [`Toggle`] for a process that is or is not caching.
    pub fn resolve(&self, caching: bool) -> Features {
        let sun_moon = self.attributes.sun_moon.resolve(caching);
        let regression = self.attributes.regression.resolve(caching);
        Features {
            caching,
            read_only: self.cache.read_only,
            trust_files: self.fileset.trust_files.resolve(caching),
            sun_moon,
            regression,
            raw_data: self.attributes.raw_data.resolve(caching),
            sun_moon_clouds_filter: sun_moon && regression,
        }
    }
}

/// A feature switch that may depend on whether caching is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Toggle {
    Always,
    Never,
    WhenCaching,
    WhenNotCaching,
}

impl Toggle {
    pub fn resolve(self, caching: bool) -> bool {
        match self {
            Toggle::Always => true,
            Toggle::Never => false,
            Toggle::WhenCaching => caching,
            Toggle::WhenNotCaching => !caching,
        }
    }
}

/// Resolved feature switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub caching: bool,
    pub read_only: bool,
    pub trust_files: bool,
    pub sun_moon: bool,
    pub regression: bool,
    pub raw_data: bool,
    pub sun_moon_clouds_filter: bool,
}

/// Data directory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root holding one directory per station, or the files of a single one.
    pub directory: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.directory.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "data.directory".to_string(),
                message: "data directory cannot be empty".to_string(),
            });
        }
        errors
    }
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; caching is disabled when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Wait for the cache lock instead of falling back to read-only.
    pub block: bool,
    /// Never write to the cache, even when the lock is free.
    pub read_only: bool,
    /// Wipe the cache after an unexpected failure.
    pub clear_on_errors: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: None,
            block: false,
            read_only: false,
            clear_on_errors: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Some(directory) = &self.directory
            && directory.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "cache.directory".to_string(),
                message: "cache directory cannot be empty (omit it to disable caching)"
                    .to_string(),
            });
        }
        errors
    }
}

/// Fileset settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesetConfig {
    /// Whether file names can be trusted to name their month.
    pub trust_files: Toggle,
}

impl Default for FilesetConfig {
    fn default() -> Self {
        Self {
            trust_files: Toggle::WhenNotCaching,
        }
    }
}

/// Attribute module switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributesConfig {
    pub sun_moon: Toggle,
    pub regression: Toggle,
    pub raw_data: Toggle,
    /// Twilight used by nightly queries that do not name one.
    pub default_twilight: TwilightType,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            sun_moon: Toggle::WhenCaching,
            regression: Toggle::WhenCaching,
            raw_data: Toggle::WhenCaching,
            default_twilight: TwilightType::Nautical,
        }
    }
}

/// Regression window sizes, in minutes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    pub time_range_minutes: f64,
    pub averaging_time_range_minutes: f64,
    pub time_shift_minutes: f64,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        let window = RegressionWindow::default();
        Self {
            time_range_minutes: window.time_range_minutes,
            averaging_time_range_minutes: window.averaging_minutes,
            time_shift_minutes: window.time_shift_minutes,
        }
    }
}

impl RegressionConfig {
    pub fn window(&self) -> RegressionWindow {
        RegressionWindow {
            time_range_minutes: self.time_range_minutes,
            averaging_minutes: self.averaging_time_range_minutes,
            time_shift_minutes: self.time_shift_minutes,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (field, value) in [
            ("regression.time_range_minutes", self.time_range_minutes),
            (
                "regression.averaging_time_range_minutes",
                self.averaging_time_range_minutes,
            ),
        ] {
            if !(value.is_finite() && value > 0.0) {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("{} must be a positive number of minutes", value),
                });
            }
        }
        if !(self.time_shift_minutes.is_finite() && self.time_shift_minutes >= 0.0) {
            errors.push(ValidationError {
                field: "regression.time_shift_minutes".to_string(),
                message: format!("{} cannot be negative", self.time_shift_minutes),
            });
        }
        errors
    }
}

/// Filter thresholds; elevations in degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub mean_r_squared: f64,
    pub sun_elevation: f64,
    pub moon_elevation: f64,
    pub moon_illumination: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        let thresholds = FilterThresholds::default();
        Self {
            mean_r_squared: thresholds.mean_r_squared,
            sun_elevation: thresholds.sun_elevation,
            moon_elevation: thresholds.moon_elevation,
            moon_illumination: thresholds.moon_illumination,
        }
    }
}

impl FilterConfig {
    pub fn thresholds(&self) -> FilterThresholds {
        FilterThresholds {
            mean_r_squared: self.mean_r_squared,
            sun_elevation: self.sun_elevation,
            moon_elevation: self.moon_elevation,
            moon_illumination: self.moon_illumination,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(self.mean_r_squared.is_finite() && self.mean_r_squared >= 0.0) {
            errors.push(ValidationError {
                field: "filter.mean_r_squared".to_string(),
                message: format!("{} cannot be negative", self.mean_r_squared),
            });
        }
        for (field, value) in [
            ("filter.sun_elevation", self.sun_elevation),
            ("filter.moon_elevation", self.moon_elevation),
        ] {
            if !(-90.0..=90.0).contains(&value) {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: format!("elevation {} is outside -90 to 90 degrees", value),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.moon_illumination) {
            errors.push(ValidationError {
                field: "filter.moon_illumination".to_string(),
                message: format!(
                    "illuminated fraction {} is outside 0 to 1",
                    self.moon_illumination
                ),
            });
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `filter.sun_elevation`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sqm")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.data.directory, PathBuf::from("data"));
        assert!(config.cache.directory.is_none());
        assert!(config.cache.clear_on_errors);
        assert_eq!(config.fileset.trust_files, Toggle::WhenNotCaching);
        assert_eq!(config.attributes.default_twilight, TwilightType::Nautical);
        assert_eq!(config.regression.time_range_minutes, 90.0);
        assert_eq!(config.filter.moon_illumination, 0.1);
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_resolve_without_cache() {
        let features = Config::default().resolve(false);
        assert!(!features.caching);
        assert!(features.trust_files);
        assert!(!features.sun_moon);
        assert!(!features.regression);
        assert!(!features.raw_data);
        assert!(!features.sun_moon_clouds_filter);
    }

    #[test]
    fn test_resolve_with_cache() {
        let features = Config::default().resolve(true);
        assert!(!features.trust_files);
        assert!(features.sun_moon);
        assert!(features.regression);
        assert!(features.sun_moon_clouds_filter);
    }

    #[test]
    fn test_filter_needs_both_modules() {
        let mut config = Config::default();
        config.attributes.sun_moon = Toggle::Never;
        let features = config.resolve(true);
        assert!(features.regression);
        assert!(!features.sun_moon_clouds_filter);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [data]
            directory = "/srv/sqm"

            [cache]
            directory = "/var/cache/sqm"
            block = true
            clear_on_errors = false

            [fileset]
            trust_files = "always"

            [attributes]
            raw_data = "never"
            default_twilight = "astronomical"

            [regression]
            time_shift_minutes = 30

            [filter]
            sun_elevation = -18
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.data.directory, PathBuf::from("/srv/sqm"));
        assert_eq!(config.cache.directory, Some(PathBuf::from("/var/cache/sqm")));
        assert!(config.cache.block);
        assert!(!config.cache.read_only);
        assert!(!config.cache.clear_on_errors);
        assert_eq!(config.fileset.trust_files, Toggle::Always);
        assert_eq!(config.attributes.raw_data, Toggle::Never);
        assert_eq!(config.attributes.sun_moon, Toggle::WhenCaching);
        assert_eq!(config.attributes.default_twilight, TwilightType::Astronomical);
        assert_eq!(config.regression.time_shift_minutes, 30.0);
        assert_eq!(config.regression.time_range_minutes, 90.0);
        assert_eq!(config.filter.thresholds().sun_elevation, -18.0);
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.cache.directory = Some(PathBuf::from("/tmp/sqm-cache"));
        config.fileset.trust_files = Toggle::Never;
        config.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();

        let result = Config::load(&config_path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_unknown_toggle_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[fileset]\ntrust_files = \"sometimes\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.data.directory = PathBuf::new();
        config.regression.time_range_minutes = 0.0;
        config.filter.moon_illumination = 1.5;
        config.filter.sun_elevation = -100.0;

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "data.directory",
                "regression.time_range_minutes",
                "filter.sun_elevation",
                "filter.moon_illumination"
            ]
        );
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![ValidationError {
            field: "filter.moon_illumination".to_string(),
            message: "illuminated fraction 2 is outside 0 to 1".to_string(),
        }]);
        let display = error.to_string();
        assert!(display.contains("Configuration validation failed"));
        assert!(display.contains("  - filter.moon_illumination: illuminated"));
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with("sqm/config.toml"));
    }
}
