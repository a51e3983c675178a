use crate::synthetic::SyntheticTelescopeConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Number of sky realizations drawn per band when no value is configured.
pub const DEFAULT_NSAMPLES: usize = 100;

/// Eigenmode count at and above which the Monte-Carlo path is used.
pub const DEFAULT_NSWITCH: usize = 200;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs of the Fisher estimator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EstimatorConfig {
    /// Sky realizations per band. The diagonal bias correction needs at least two.
    pub nsamples: usize,
    /// Orders with at least this many eigenmodes are estimated by Monte-Carlo.
    pub nswitch: usize,
    /// Minimum KL eigenvalue retained when projecting.
    pub threshold: f64,
    /// Base seed; every (order, band) pair derives its own stream from it.
    pub seed: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            nsamples: DEFAULT_NSAMPLES,
            nswitch: DEFAULT_NSWITCH,
            threshold: 0.0,
            seed: 0x5EED_F15E,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nsamples < 2 {
            return Err(ConfigError::Invalid(format!(
                "nsamples must be at least 2 for the bias-corrected estimator, got {}",
                self.nsamples
            )));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be finite and non-negative, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Everything the `cylps` driver needs: estimator settings plus the synthetic telescope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub estimator: EstimatorConfig,
    pub telescope: SyntheticTelescopeConfig,
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.estimator.validate()?;
        self.telescope.validate()
    }
}
