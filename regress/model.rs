//! # The Trained Flowering-Time Model
//!
//! A self-contained bundle of everything needed to predict a season's
//! unlabelled plots: the fitted recipe, the LASSO coefficients on the
//! recipe's output columns, and the evidence behind the choice (CV curve,
//! held-out metrics and predictions). Saved as human-readable TOML.

use super::RegressionError;
use super::metrics::EvaluationMetrics;
use super::preprocess::Recipe;
use super::tuning::CvPoint;
use crate::table::PlotTable;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The model needs feature column '{0}', which is missing from the prediction table.")]
    MissingFeature(String),
    #[error(
        "The model file is inconsistent: {coefficients} coefficients for {columns} recipe columns."
    )]
    CorruptModel { coefficients: usize, columns: usize },
    #[error("Applying the preprocessing recipe failed: {0}")]
    Recipe(#[from] RegressionError),
}

/// One held-out plot of the test partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPrediction {
    pub plot_id: String,
    pub observed_gdd: f64,
    pub predicted_gdd: f64,
}

/// A non-zero LASSO coefficient on the standardised scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub feature: String,
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub season: String,
    pub alpha: f64,
    pub intercept: f64,
    pub n_train: usize,
    pub n_test: usize,
    /// Aligned with `recipe.kept`.
    pub coefficients: Vec<f64>,
    pub recipe: Recipe,
    pub metrics: EvaluationMetrics,
    pub cv_curve: Vec<CvPoint>,
    pub test_predictions: Vec<TestPrediction>,
}

impl TrainedModel {
    /// Predicts every plot of `table`. Columns are matched by name, so extra
    /// columns and column order do not matter.
    pub fn predict(&self, table: &PlotTable) -> Result<Array1<f64>, ModelError> {
        if self.coefficients.len() != self.recipe.kept.len() {
            return Err(ModelError::CorruptModel {
                coefficients: self.coefficients.len(),
                columns: self.recipe.kept.len(),
            });
        }
        if let Some(missing) = self
            .recipe
            .predictors
            .iter()
            .find(|name| table.column(name).is_none())
        {
            return Err(ModelError::MissingFeature(missing.clone()));
        }

        let raw = table
            .matrix(&self.recipe.predictors)
            .map_err(RegressionError::from)?;
        let prepared = self.recipe.apply(&raw)?;
        let beta = Array1::from(self.coefficients.clone());
        Ok(prepared.dot(&beta) + self.intercept)
    }

    /// Features with a non-zero coefficient, largest magnitude first.
    pub fn nonzero_coefficients(&self) -> Vec<Coefficient> {
        let mut out: Vec<Coefficient> = self
            .recipe
            .kept
            .iter()
            .zip(&self.coefficients)
            .filter(|(_, b)| **b != 0.0)
            .map(|(feature, &estimate)| Coefficient {
                feature: feature.clone(),
                estimate,
            })
            .collect();
        out.sort_by(|a, b| b.estimate.abs().total_cmp(&a.estimate.abs()));
        out
    }

    /// Saves the trained model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
