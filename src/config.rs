use crate::scoring::{TierThresholds, PLATINUM_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "STRIDEPOINT_CONFIG";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },
    #[error("tier thresholds must ascend: bronze {bronze} <= silver {silver} <= gold {gold} <= platinum {platinum}")]
    ThresholdsOutOfOrder {
        bronze: u64,
        silver: u64,
        gold: u64,
        platinum: u64,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tracking: TrackingConfig,
    pub scoring: ScoringConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub accuracy_threshold_m: f64,      // Fixes with a worse accuracy radius are rejected
    pub max_plausible_jump_km: f64,     // Larger hops from the previous fix are rejected
    pub min_distance_threshold_km: f64, // Smaller displacements count as noise
    pub min_sample_interval_s: u64,     // Fixes closer in time count as noise
    pub max_speed_kmh: f64,             // Derived speed is clamped to this
    pub steps_per_km: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: 50.0,
            max_plausible_jump_km: 1.0,
            min_distance_threshold_km: 0.01,
            min_sample_interval_s: 10,
            max_speed_kmh: 100.0,
            steps_per_km: 1300.0,
        }
    }
}

/// Platinum and diamond thresholds are fixed and deliberately absent here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub points_per_km: f64,
    pub bronze_threshold: u64,
    pub silver_threshold: u64,
    pub gold_threshold: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let thresholds = TierThresholds::default();
        Self {
            points_per_km: 10.0,
            bronze_threshold: thresholds.bronze,
            silver_threshold: thresholds.silver,
            gold_threshold: thresholds.gold,
        }
    }
}

impl ScoringConfig {
    pub fn thresholds(&self) -> TierThresholds {
        TierThresholds {
            bronze: self.bronze_threshold,
            silver: self.silver_threshold,
            gold: self.gold_threshold,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_path: PathBuf,
    pub max_conflict_retries: u32, // Attempts after the first before giving up
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: PathBuf::from("stridepoint.db"),
            max_conflict_retries: 3,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub directory: PathBuf,
    pub file_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("logs"),
            file_name: "stridepoint.log".to_string(),
        }
    }
}

impl Config {
    /// Path from `STRIDEPOINT_CONFIG`, or `config.toml` in the working directory.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Loads the config file at `path`.
    /// If it doesn't exist, writes a default one there for the user to edit.
    /// A file that fails to parse is ignored in favour of the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let config = match fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Config::default()
                }
            },
            Err(_) => {
                let config = Config::default();
                config.write_default(path);
                info!("Loaded default configuration.");
                config
            }
        };

        config.validate()?;
        Ok(config)
    }

    fn write_default(&self, path: &Path) {
        match toml::to_string_pretty(self) {
            Ok(toml_string) => {
                if fs::write(path, toml_string).is_err() {
                    warn!("Could not write default {} to disk.", path.display());
                }
            }
            Err(e) => warn!("Could not serialize default configuration: {}", e),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.tracking;
        for (field, value) in [
            ("tracking.accuracy_threshold_m", t.accuracy_threshold_m),
            ("tracking.max_plausible_jump_km", t.max_plausible_jump_km),
            ("tracking.min_distance_threshold_km", t.min_distance_threshold_km),
            ("tracking.max_speed_kmh", t.max_speed_kmh),
            ("tracking.steps_per_km", t.steps_per_km),
            ("scoring.points_per_km", self.scoring.points_per_km),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }

        let s = &self.scoring;
        if !(s.bronze_threshold <= s.silver_threshold
            && s.silver_threshold <= s.gold_threshold
            && s.gold_threshold <= PLATINUM_THRESHOLD)
        {
            return Err(ConfigError::ThresholdsOutOfOrder {
                bronze: s.bronze_threshold,
                silver: s.silver_threshold,
                gold: s.gold_threshold,
                platinum: PLATINUM_THRESHOLD,
            });
        }
        Ok(())
    }
}
