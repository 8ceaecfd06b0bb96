//! # Season Configuration
//!
//! One TOML file describes one season: where its inputs live, how its design
//! columns are named, which experiment feeds each analysis and which plots are
//! known to be unviable. Every section has defaults, so a minimal file only
//! names the season and its inputs:
//!
//! ```toml
//! season = "2021"
//! output_dir = "out/2021"
//!
//! [inputs]
//! features = "plot_summary_2021.csv"
//! design = "design_2021.csv"
//!
//! [features]
//! reference_soil_column = "elev_soil_q05_20210610"
//! ```
//!
//! Relative paths are resolved against the directory of the configuration file.

use crate::features::FeatureSpec;
use crate::mixed::heritability::HeritabilityConfig;
use crate::regress::train::RegressionConfig;
use crate::table::DesignColumns;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPaths {
    pub features: PathBuf,
    pub design: PathBuf,
    #[serde(default = "default_id_column")]
    pub feature_id_column: String,
}

fn default_id_column() -> String {
    "plot_id".to_string()
}

/// Plots known to be unviable (failed germination, destroyed plants). This
/// list is curated by hand for each season.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub exclude_plots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub season: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub inputs: InputPaths,
    #[serde(default)]
    pub design_columns: DesignColumns,
    #[serde(default)]
    pub features: FeatureSpec,
    #[serde(default)]
    pub heritability: HeritabilityConfig,
    #[serde(default)]
    pub regression: RegressionConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl SeasonConfig {
    /// Reads, resolves and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parses and validates configuration text. Paths are left as written.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.output_dir,
            &mut self.inputs.features,
            &mut self.inputs.design,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.regression;
        if self.season.trim().is_empty() {
            return Err(ConfigError::Invalid("season must not be empty".to_string()));
        }
        if !(r.train_fraction > 0.0 && r.train_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "regression.train_fraction must lie in (0, 1), got {}",
                r.train_fraction
            )));
        }
        if r.folds < 2 {
            return Err(ConfigError::Invalid(format!(
                "regression.folds must be at least 2, got {}",
                r.folds
            )));
        }
        if r.strata_bins < 1 {
            return Err(ConfigError::Invalid(
                "regression.strata_bins must be at least 1".to_string(),
            ));
        }
        if r.grid.points < 1 {
            return Err(ConfigError::Invalid(
                "regression.grid.points must be at least 1".to_string(),
            ));
        }
        if r.grid.min_exponent > r.grid.max_exponent {
            return Err(ConfigError::Invalid(format!(
                "regression.grid exponent range is reversed ({} > {})",
                r.grid.min_exponent, r.grid.max_exponent
            )));
        }
        let (lo, hi) = self.heritability.reml.log_ratio_bounds;
        if lo >= hi {
            return Err(ConfigError::Invalid(format!(
                "heritability.reml.log_ratio_bounds must be increasing, got ({lo}, {hi})"
            )));
        }
        if self.features.reference_soil_column.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "features.reference_soil_column must name the soil elevation column".to_string(),
            ));
        }
        Ok(())
    }
}
