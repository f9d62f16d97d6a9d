use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::observability::parse_bool;
use crate::rating::RatingParams;
use crate::state::RebuildPhase;

pub const DEFAULT_STORE_PATH: &str = "racealpha.sqlite";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{kind} window sizes must be positive")]
    ZeroWindow { kind: &'static str },
    #[error("{kind} window size {size} is configured twice")]
    DuplicateWindow { kind: &'static str, size: usize },
    #[error("minimum population fraction must be within [0, 1], got {0}")]
    PopulationOutOfRange(f64),
    #[error("rating bounds are inverted: min {min} > max {max}")]
    InvertedRatingBounds { min: f64, max: f64 },
    #[error("rating base {base} lies outside [{min}, {max}]")]
    BaseOutsideBounds { base: f64, min: f64, max: f64 },
    #[error("insert batch size must be positive")]
    ZeroBatchSize,
    #[error("failed to encode configuration for fingerprinting: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub horse_windows: Vec<usize>,
    pub connection_windows: Vec<usize>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            horse_windows: vec![5, 20],
            connection_windows: vec![20, 50, 100],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationThresholds {
    pub min_rows: u64,
    pub min_population: f64,
    pub required_columns: Vec<String>,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_rows: 100_000,
            min_population: 0.95,
            required_columns: [
                "race_id",
                "horse_id",
                "region",
                "class_tier",
                "horse_total_races",
                "rating_before",
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebuildConfig {
    pub store_path: PathBuf,
    pub reference_path: Option<PathBuf>,
    pub aggregator: AggregatorConfig,
    pub rating: RatingParams,
    pub validation: ValidationThresholds,
    /// Persist each phase output so an interrupted run can resume.
    pub checkpoint_phases: bool,
    pub insert_batch_size: usize,
    /// Leaves the run paused after this phase; `resume` picks it up later.
    pub stop_after: Option<RebuildPhase>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            reference_path: None,
            aggregator: AggregatorConfig::default(),
            rating: RatingParams::default(),
            validation: ValidationThresholds::default(),
            checkpoint_phases: true,
            insert_batch_size: 5_000,
            stop_after: None,
        }
    }
}

impl RebuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_windows("horse", &self.aggregator.horse_windows)?;
        check_windows("connection", &self.aggregator.connection_windows)?;

        let population = self.validation.min_population;
        if !(0.0..=1.0).contains(&population) {
            return Err(ConfigError::PopulationOutOfRange(population));
        }

        let rating = &self.rating;
        if rating.min_rating > rating.max_rating {
            return Err(ConfigError::InvertedRatingBounds {
                min: rating.min_rating,
                max: rating.max_rating,
            });
        }
        if rating.base_rating < rating.min_rating || rating.base_rating > rating.max_rating {
            return Err(ConfigError::BaseOutsideBounds {
                base: rating.base_rating,
                min: rating.min_rating,
                max: rating.max_rating,
            });
        }

        if self.insert_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }

    /// Hash of every setting that changes snapshot content.
    pub fn fingerprint(&self) -> Result<String, ConfigError> {
        #[derive(Serialize)]
        struct Fingerprinted<'a> {
            aggregator: &'a AggregatorConfig,
            rating: &'a RatingParams,
        }
        let payload = serde_json::to_vec(&Fingerprinted {
            aggregator: &self.aggregator,
            rating: &self.rating,
        })
        .map_err(|err| ConfigError::Encode(err.to_string()))?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(hex::encode(hasher.finalize()))
    }
}

fn check_windows(kind: &'static str, sizes: &[usize]) -> Result<(), ConfigError> {
    for (idx, size) in sizes.iter().enumerate() {
        if *size == 0 {
            return Err(ConfigError::ZeroWindow { kind });
        }
        if sizes[..idx].contains(size) {
            return Err(ConfigError::DuplicateWindow { kind, size: *size });
        }
    }
    Ok(())
}

pub fn rebuild_config_from_env() -> RebuildConfig {
    let mut config = RebuildConfig::default();

    if let Some(path) = env_string("RACEALPHA_STORE_PATH") {
        config.store_path = PathBuf::from(path);
    }
    if let Some(path) = env_string("RACEALPHA_REFERENCE_PATH") {
        config.reference_path = Some(PathBuf::from(path));
    }
    if let Some(min_rows) = env_string("RACEALPHA_MIN_ROWS").and_then(|v| v.parse().ok()) {
        config.validation.min_rows = min_rows;
    }
    if let Some(population) =
        env_string("RACEALPHA_MIN_POPULATION").and_then(|v| v.parse::<f64>().ok())
    {
        config.validation.min_population = population;
    }
    if let Some(k) = env_string("RACEALPHA_RATING_K").and_then(|v| v.parse::<f64>().ok()) {
        config.rating.k_factor = k;
    }
    if let Some(threshold) =
        env_string("RACEALPHA_PARALLEL_FIELD_THRESHOLD").and_then(|v| v.parse().ok())
    {
        config.rating.parallel_field_threshold = threshold;
    }
    if let Some(windows) = env_string("RACEALPHA_HORSE_WINDOWS").and_then(|v| parse_windows(&v)) {
        config.aggregator.horse_windows = windows;
    }
    if let Some(windows) =
        env_string("RACEALPHA_CONNECTION_WINDOWS").and_then(|v| parse_windows(&v))
    {
        config.aggregator.connection_windows = windows;
    }
    if let Some(enabled) = env_string("RACEALPHA_CHECKPOINTS").and_then(|v| parse_bool(&v)) {
        config.checkpoint_phases = enabled;
    }
    if let Some(phase) = env_string("RACEALPHA_STOP_AFTER").and_then(|v| RebuildPhase::parse(&v)) {
        config.stop_after = Some(phase);
    }

    config
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_windows(raw: &str) -> Option<Vec<usize>> {
    raw.split(',')
        .map(|part| part.trim().parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()
        .filter(|sizes| !sizes.is_empty())
}
