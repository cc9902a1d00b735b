//! Selection run configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `SUBSET_*` environment variables, then command-line flags. Every layer
//! only overrides what it sets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::diversity::{
    parse_subset_sizes, FacilityLocationSelector, Optimizer, SimilarityMode, SubsetRequest,
    ToleranceMode, DEFAULT_EPSILON, DEFAULT_TILE_SIZE,
};
use crate::encoder::EncoderConfig;
use crate::template::DEFAULT_TEMPLATE;
use crate::utils::{Backoff, RetryPolicy};

/// Upper bound on a single retry delay.
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Errors that can occur while building the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("Invalid configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// What to do with a record that cannot be parsed or rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataErrorPolicy {
    /// Log it and leave it out of embedding and selection.
    #[default]
    Skip,
    /// Abort the run.
    Fail,
}

/// A template defined in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomTemplate {
    pub source: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

/// Template selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Template used to render every record.
    pub name: String,
    /// Extra templates registered next to the built-in ones.
    pub custom: BTreeMap<String, CustomTemplate>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_TEMPLATE.to_string(),
            custom: BTreeMap::new(),
        }
    }
}

/// Resource and resilience settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Allow running on the CPU when no accelerator is available.
    pub testing_mode: bool,
    /// Retries after the first failed attempt of a retried operation.
    pub max_retries: u32,
    /// Base delay between retries; doubles per attempt.
    pub retry_delay_ms: u64,
    /// Reuse embeddings from a previous run with identical inputs.
    pub embedding_cache: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            testing_mode: false,
            max_retries: 2,
            retry_delay_ms: 1000,
            embedding_cache: true,
        }
    }
}

/// Full configuration of a selection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Input files or directories.
    pub input_files: Vec<PathBuf>,
    /// Root directory for per-dataset outputs.
    pub output_dir: PathBuf,
    /// Requested subset sizes.
    pub subset_sizes: Vec<SubsetRequest>,
    /// Folds per dataset.
    pub num_folds: usize,
    /// Lazy greedy acceptance tolerance.
    pub epsilon: f64,
    pub tolerance_mode: ToleranceMode,
    pub optimizer: Optimizer,
    pub similarity_mode: SimilarityMode,
    /// Rows per similarity tile.
    pub tile_size: usize,
    /// Seed for fold partitioning.
    pub seed: u64,
    /// Correct rounding drift so each subset has exactly the target size.
    pub exact_sizes: bool,
    /// Treat all inputs as one dataset.
    pub combine_files: bool,
    pub on_data_error: DataErrorPolicy,
    pub encoder: EncoderConfig,
    pub template: TemplateConfig,
    pub system: SystemConfig,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            input_files: Vec::new(),
            output_dir: PathBuf::from("output"),
            subset_sizes: Vec::new(),
            num_folds: 50,
            epsilon: DEFAULT_EPSILON,
            tolerance_mode: ToleranceMode::Absolute,
            optimizer: Optimizer::LazyGreedy,
            similarity_mode: SimilarityMode::Dense,
            tile_size: DEFAULT_TILE_SIZE,
            seed: 42,
            exact_sizes: true,
            combine_files: false,
            on_data_error: DataErrorPolicy::Skip,
            encoder: EncoderConfig::default(),
            template: TemplateConfig::default(),
            system: SystemConfig::default(),
        }
    }
}

impl SelectionConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Applies `SUBSET_*` overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `SUBSET_OUTPUT_DIR`: output directory
    /// - `SUBSET_SIZES`: comma-separated subset sizes
    /// - `SUBSET_NUM_FOLDS`: folds per dataset
    /// - `SUBSET_EPSILON`: lazy greedy tolerance
    /// - `SUBSET_SEED`: partition seed
    /// - `SUBSET_BATCH_SIZE`: texts per encoding batch
    /// - `SUBSET_NUM_GPUS`: accelerators to use
    /// - `SUBSET_ENCODER_TYPE`: encoder registry key
    /// - `SUBSET_ENCODER_MODEL`: model identifier
    /// - `SUBSET_TEMPLATE_NAME`: template registry key
    /// - `SUBSET_TESTING_MODE`: allow CPU fallback
    /// - `SUBSET_MAX_RETRIES`: retries per operation
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies `SUBSET_*` overrides from an arbitrary lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SUBSET_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("SUBSET_SIZES") {
            self.subset_sizes =
                parse_subset_sizes(&val).map_err(|e| ConfigError::InvalidValue {
                    key: "SUBSET_SIZES".to_string(),
                    message: e.to_string(),
                })?;
        }

        if let Some(val) = lookup("SUBSET_NUM_FOLDS") {
            self.num_folds = parse_env_value(&val, "SUBSET_NUM_FOLDS")?;
        }

        if let Some(val) = lookup("SUBSET_EPSILON") {
            self.epsilon = parse_env_value(&val, "SUBSET_EPSILON")?;
        }

        if let Some(val) = lookup("SUBSET_SEED") {
            self.seed = parse_env_value(&val, "SUBSET_SEED")?;
        }

        if let Some(val) = lookup("SUBSET_BATCH_SIZE") {
            self.encoder.batch_size = parse_env_value(&val, "SUBSET_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("SUBSET_NUM_GPUS") {
            self.encoder.num_gpus = Some(parse_env_value(&val, "SUBSET_NUM_GPUS")?);
        }

        if let Some(val) = lookup("SUBSET_ENCODER_TYPE") {
            self.encoder.encoder_type = val;
        }

        if let Some(val) = lookup("SUBSET_ENCODER_MODEL") {
            self.encoder.model = val;
        }

        if let Some(val) = lookup("SUBSET_TEMPLATE_NAME") {
            self.template.name = val;
        }

        if let Some(val) = lookup("SUBSET_TESTING_MODE") {
            self.system.testing_mode = parse_env_bool(&val, "SUBSET_TESTING_MODE")?;
        }

        if let Some(val) = lookup("SUBSET_MAX_RETRIES") {
            self.system.max_retries = parse_env_value(&val, "SUBSET_MAX_RETRIES")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_files.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one input file is required".to_string(),
            ));
        }

        if self.subset_sizes.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one subset size is required".to_string(),
            ));
        }

        if self.num_folds == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_folds must be greater than 0".to_string(),
            ));
        }

        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "epsilon must be a non-negative number".to_string(),
            ));
        }

        if self.tolerance_mode == ToleranceMode::Relative && self.epsilon > 1.0 {
            return Err(ConfigError::ValidationFailed(
                "relative epsilon must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.tile_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "tile_size must be greater than 0".to_string(),
            ));
        }

        if self.encoder.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.encoder.dimension == 0 {
            return Err(ConfigError::ValidationFailed(
                "embedding dimension must be greater than 0".to_string(),
            ));
        }

        if self.encoder.encoder_type.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "encoder_type cannot be empty".to_string(),
            ));
        }

        if self.template.name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "template name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Retry policy derived from the system settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.system.max_retries.saturating_add(1)).with_backoff(
            Backoff::Exponential {
                base: Duration::from_millis(self.system.retry_delay_ms),
                max: Duration::from_millis(MAX_RETRY_DELAY_MS.max(self.system.retry_delay_ms)),
            },
        )
    }

    /// Greedy selector derived from the selection settings.
    pub fn selector(&self) -> FacilityLocationSelector {
        FacilityLocationSelector::new()
            .with_optimizer(self.optimizer)
            .with_epsilon(self.epsilon, self.tolerance_mode)
            .with_tile_size(self.tile_size)
    }

    /// Directory holding one dataset's outputs.
    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.output_dir.join(dataset)
    }

    /// Builder method to set the input files.
    pub fn with_input_files(mut self, files: Vec<PathBuf>) -> Self {
        self.input_files = files;
        self
    }

    /// Builder method to set the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder method to set the subset sizes.
    pub fn with_subset_sizes(mut self, sizes: Vec<SubsetRequest>) -> Self {
        self.subset_sizes = sizes;
        self
    }

    /// Builder method to set the fold count.
    pub fn with_num_folds(mut self, num_folds: usize) -> Self {
        self.num_folds = num_folds;
        self
    }

    /// Builder method to set the encoder settings.
    pub fn with_encoder(mut self, encoder: EncoderConfig) -> Self {
        self.encoder = encoder;
        self
    }

    /// Builder method to set the template name.
    pub fn with_template_name(mut self, name: impl Into<String>) -> Self {
        self.template.name = name.into();
        self
    }

    /// Builder method to enable CPU fallback.
    pub fn with_testing_mode(mut self, testing_mode: bool) -> Self {
        self.system.testing_mode = testing_mode;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
