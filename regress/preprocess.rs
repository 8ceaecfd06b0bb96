//! # Preprocessing Recipe
//!
//! The recipe is estimated on training rows only and then replayed, from its
//! stored statistics, on every other matrix it meets (CV hold-outs, the test
//! partition, unlabelled plots). Steps, in order:
//!
//! 1. remove near-zero-variance columns,
//! 2. centre and scale with the training mean and standard deviation,
//! 3. impute missing entries with the training median of the scaled column.

use super::RegressionError;
use crate::stats;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Thresholds of the near-zero-variance filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NzvOptions {
    /// Ratio of the most common to the second most common value.
    pub freq_cut: f64,
    /// Distinct values as a percentage of all rows.
    pub unique_cut: f64,
}

impl Default for NzvOptions {
    fn default() -> Self {
        Self {
            freq_cut: 95.0 / 5.0,
            unique_cut: 10.0,
        }
    }
}

/// A fitted recipe. `predictors` are the input columns it expects, `kept`
/// the subset that survives the filter; the statistics align with `kept`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub predictors: Vec<String>,
    pub kept: Vec<String>,
    pub removed: Vec<String>,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
    pub medians: Vec<f64>,
}

impl Recipe {
    /// Estimates the recipe on the training matrix `x`, whose columns are `names`.
    pub fn fit(x: &Array2<f64>, names: &[String], nzv: &NzvOptions) -> Result<Self, RegressionError> {
        if x.ncols() != names.len() {
            return Err(RegressionError::ShapeMismatch {
                found: x.ncols(),
                expected: names.len(),
            });
        }

        let mut kept = Vec::new();
        let mut removed = Vec::new();
        let mut means = Vec::new();
        let mut scales = Vec::new();
        let mut medians = Vec::new();

        for (column, name) in x.axis_iter(Axis(1)).zip(names) {
            if is_near_zero_variance(column, nzv) {
                removed.push(name.clone());
                continue;
            }
            let values = stats::finite(&column.to_vec());
            let mean = stats::mean(&values).unwrap_or(0.0);
            let scale = match stats::sample_variance(&values) {
                Some(v) if v > 0.0 && v.is_finite() => v.sqrt(),
                _ => 1.0,
            };
            let scaled: Vec<f64> = values.iter().map(|v| (v - mean) / scale).collect();
            let median = stats::median_finite(&scaled).unwrap_or(0.0);

            kept.push(name.clone());
            means.push(mean);
            scales.push(scale);
            medians.push(median);
        }

        if kept.is_empty() {
            return Err(RegressionError::NoUsableFeatures);
        }
        if !removed.is_empty() {
            log::debug!("Near-zero-variance filter removed {} columns", removed.len());
        }

        Ok(Self {
            predictors: names.to_vec(),
            kept,
            removed,
            means,
            scales,
            medians,
        })
    }

    /// Applies the stored statistics to a matrix laid out like `predictors`.
    pub fn apply(&self, x: &Array2<f64>) -> Result<Array2<f64>, RegressionError> {
        if x.ncols() != self.predictors.len() {
            return Err(RegressionError::ShapeMismatch {
                found: x.ncols(),
                expected: self.predictors.len(),
            });
        }
        let position: HashMap<&str, usize> = self
            .predictors
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut out = Array2::zeros((x.nrows(), self.kept.len()));
        for (j, name) in self.kept.iter().enumerate() {
            let source = position.get(name.as_str()).copied().ok_or_else(|| {
                RegressionError::InvalidSetting(format!("recipe column '{name}' is not a predictor"))
            })?;
            let (mean, scale, median) = (self.means[j], self.scales[j], self.medians[j]);
            for (i, &v) in x.column(source).iter().enumerate() {
                out[[i, j]] = if v.is_finite() { (v - mean) / scale } else { median };
            }
        }
        Ok(out)
    }
}

fn is_near_zero_variance(column: ArrayView1<f64>, nzv: &NzvOptions) -> bool {
    let mut counts: HashMap<u64, usize> = HashMap::new();
    for &v in column.iter().filter(|v| v.is_finite()) {
        // Fold -0.0 into 0.0 before hashing the bit pattern.
        let key = if v == 0.0 { 0.0_f64.to_bits() } else { v.to_bits() };
        *counts.entry(key).or_insert(0) += 1;
    }
    if counts.len() <= 1 {
        return true;
    }

    let mut frequencies: Vec<usize> = counts.values().copied().collect();
    frequencies.sort_unstable_by(|a, b| b.cmp(a));
    let freq_ratio = frequencies[0] as f64 / frequencies[1] as f64;
    let percent_unique = 100.0 * counts.len() as f64 / column.len() as f64;
    freq_ratio > nzv.freq_cut && percent_unique <= nzv.unique_cut
}
