//! # Penalty Selection by Cross-Validation
//!
//! Every fold re-estimates the whole preprocessing recipe on its own training
//! rows before fitting the LASSO path, so no statistic of a held-out row ever
//! reaches the model that predicts it.
//!
//! Large penalties shrink every coefficient to zero and the fold then predicts
//! a constant, for which the squared correlation is undefined. Such folds are
//! expected: they are skipped for that penalty, and a penalty is only ranked
//! on the folds where its metric exists.

use super::RegressionError;
use super::lasso::{LassoOptions, lasso_path};
use super::metrics;
use super::preprocess::{NzvOptions, Recipe};
use super::split::complement;
use crate::stats;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A log-spaced grid of penalties, `10^min_exponent ..= 10^max_exponent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyGrid {
    pub min_exponent: f64,
    pub max_exponent: f64,
    pub points: usize,
}

impl Default for PenaltyGrid {
    fn default() -> Self {
        Self {
            min_exponent: -3.0,
            max_exponent: 3.0,
            points: 50,
        }
    }
}

impl PenaltyGrid {
    pub fn log_spaced(min_exponent: f64, max_exponent: f64, points: usize) -> Self {
        Self {
            min_exponent,
            max_exponent,
            points,
        }
    }

    /// Penalties in increasing order.
    pub fn values(&self) -> Vec<f64> {
        match self.points {
            0 => Vec::new(),
            1 => vec![10f64.powf(self.min_exponent)],
            k => {
                let step = (self.max_exponent - self.min_exponent) / (k - 1) as f64;
                (0..k)
                    .map(|i| 10f64.powf(self.min_exponent + step * i as f64))
                    .collect()
            }
        }
    }
}

/// Cross-validated performance of one penalty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvPoint {
    pub alpha: f64,
    pub mean_rsq: Option<f64>,
    pub std_err: Option<f64>,
    pub n_defined: usize,
    pub mean_rmse: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub best_alpha: f64,
    pub best_rsq: f64,
    pub curve: Vec<CvPoint>,
}

/// Fold-level metrics for every penalty, in grid order.
struct FoldScores {
    rsq: Vec<Option<f64>>,
    rmse: Vec<Option<f64>>,
}

fn score_fold(
    x: &Array2<f64>,
    y: &Array1<f64>,
    names: &[String],
    held_out: &[usize],
    alphas: &[f64],
    nzv: &NzvOptions,
    lasso: &LassoOptions,
) -> Result<FoldScores, RegressionError> {
    let train = complement(x.nrows(), held_out);
    let x_train = x.select(Axis(0), &train);
    let y_train = y.select(Axis(0), &train);
    let x_test = x.select(Axis(0), held_out);
    let y_test = y.select(Axis(0), held_out).to_vec();

    let recipe = Recipe::fit(&x_train, names, nzv)?;
    let prepared_train = recipe.apply(&x_train)?;
    let prepared_test = recipe.apply(&x_test)?;

    let fits = lasso_path(&prepared_train, &y_train, alphas, lasso);
    let mut rsq = Vec::with_capacity(fits.len());
    let mut rmse = Vec::with_capacity(fits.len());
    for fit in &fits {
        let predicted = fit.predict(&prepared_test).to_vec();
        rsq.push(metrics::rsq(&y_test, &predicted));
        rmse.push(metrics::rmse(&y_test, &predicted));
    }
    Ok(FoldScores { rsq, rmse })
}

/// Scores every penalty of `grid` over `folds` (held-out row indices of `x`)
/// and picks the penalty with the highest mean squared correlation. Exact
/// ties go to the larger penalty.
pub fn cross_validate(
    x: &Array2<f64>,
    y: &Array1<f64>,
    names: &[String],
    folds: &[Vec<usize>],
    grid: &PenaltyGrid,
    nzv: &NzvOptions,
    lasso: &LassoOptions,
) -> Result<CvSummary, RegressionError> {
    let alphas = grid.values();
    if alphas.is_empty() {
        return Err(RegressionError::InvalidSetting(
            "the penalty grid is empty".to_string(),
        ));
    }

    let scores: Vec<FoldScores> = folds
        .par_iter()
        .map(|held_out| score_fold(x, y, names, held_out, &alphas, nzv, lasso))
        .collect::<Result<_, _>>()?;

    let curve: Vec<CvPoint> = alphas
        .iter()
        .enumerate()
        .map(|(g, &alpha)| {
            let rsq: Vec<f64> = scores.iter().filter_map(|f| f.rsq[g]).collect();
            let rmse: Vec<f64> = scores.iter().filter_map(|f| f.rmse[g]).collect();
            let undefined = scores.len() - rsq.len();
            if undefined > 0 {
                log::debug!("alpha = {alpha:.3e}: {undefined} fold(s) predicted a constant");
            }
            let std_err = stats::sample_variance(&rsq).map(|v| (v / rsq.len() as f64).sqrt());
            CvPoint {
                alpha,
                mean_rsq: stats::mean(&rsq),
                std_err,
                n_defined: rsq.len(),
                mean_rmse: stats::mean(&rmse),
            }
        })
        .collect();

    let best = curve
        .iter()
        .filter_map(|p| p.mean_rsq.map(|r| (p.alpha, r)))
        .fold(None, |best: Option<(f64, f64)>, (alpha, r)| match best {
            Some((_, best_r)) if best_r > r => best,
            _ => Some((alpha, r)),
        })
        .ok_or(RegressionError::NoDefinedPenalty)?;

    log::info!(
        "Cross-validation selected alpha = {:.4e} (mean R² = {:.4})",
        best.0,
        best.1
    );
    Ok(CvSummary {
        best_alpha: best.0,
        best_rsq: best.1,
        curve,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regress::split::stratified_folds;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn grid_is_log_spaced_and_inclusive() {
        let values = PenaltyGrid::default().values();
        assert_eq!(values.len(), 50);
        assert_relative_eq!(values[0], 1e-3);
        assert_relative_eq!(values[49], 1e3, max_relative = 1e-12);
        let ratio = values[1] / values[0];
        assert_relative_eq!(values[30] / values[29], ratio, max_relative = 1e-9);
        assert_eq!(PenaltyGrid::log_spaced(0.0, 2.0, 1).values(), vec![1.0]);
    }

    #[test]
    fn large_penalties_are_tolerated_and_signal_is_selected() {
        let mut rng = StdRng::seed_from_u64(17);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 80;
        let x = Array2::from_shape_fn((n, 6), |_| normal.sample(&mut rng));
        let y = x.column(2).mapv(|v| 40.0 * v + 1300.0)
            + Array1::from_shape_fn(n, |_| 5.0 * normal.sample(&mut rng));
        let names: Vec<String> = (0..6).map(|i| format!("f{i}")).collect();
        let folds = stratified_folds(y.as_slice().unwrap(), 10, 4, 3).unwrap();

        let summary = cross_validate(
            &x,
            &y,
            &names,
            &folds,
            &PenaltyGrid::default(),
            &NzvOptions::default(),
            &LassoOptions::default(),
        )
        .unwrap();

        assert_eq!(summary.curve.len(), 50);
        // The largest penalties zero the model in every fold.
        let last = summary.curve.last().unwrap();
        assert_eq!(last.n_defined, 0);
        assert!(last.mean_rsq.is_none());
        assert!(last.mean_rmse.is_some());
        assert!(summary.best_rsq > 0.8);
        assert!(summary.best_alpha < 100.0);
    }

    #[test]
    fn no_defined_penalty_is_an_error() {
        let x = Array2::from_shape_fn((20, 2), |(i, j)| ((i * 7 + j * 3) % 11) as f64);
        let y = Array1::from_shape_fn(20, |i| (i % 5) as f64);
        let names = vec!["a".to_string(), "b".to_string()];
        let folds = stratified_folds(y.as_slice().unwrap(), 4, 2, 0).unwrap();
        let err = cross_validate(
            &x,
            &y,
            &names,
            &folds,
            &PenaltyGrid::log_spaced(4.0, 5.0, 3),
            &NzvOptions::default(),
            &LassoOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RegressionError::NoDefinedPenalty));
    }
}
