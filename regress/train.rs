//! # Training the Flowering-Time Model
//!
//! Labelled plots are split into a training and an untouched test partition,
//! stratified on the label. The penalty is tuned by stratified k-fold
//! cross-validation inside the training partition, the recipe and LASSO are
//! refitted on the whole training partition at the chosen penalty, and the
//! result is scored once on the test partition.

use super::RegressionError;
use super::lasso::{LassoOptions, fit_lasso};
use super::metrics::EvaluationMetrics;
use super::model::{TestPrediction, TrainedModel};
use super::preprocess::{NzvOptions, Recipe};
use super::split::{stratified_folds, stratified_split};
use super::tuning::{PenaltyGrid, cross_validate};
use crate::table::PlotTable;
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressionConfig {
    /// Experiments whose labelled plots are used for training. Empty uses all.
    pub experiments: Vec<String>,
    pub train_fraction: f64,
    pub strata_bins: usize,
    pub folds: usize,
    pub seed: u64,
    pub grid: PenaltyGrid,
    pub nzv: NzvOptions,
    pub lasso: LassoOptions,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        Self {
            experiments: Vec::new(),
            train_fraction: 0.75,
            strata_bins: 4,
            folds: 10,
            seed: 2021,
            grid: PenaltyGrid::default(),
            nzv: NzvOptions::default(),
            lasso: LassoOptions::default(),
        }
    }
}

/// Trains and evaluates a model on the plots of `features` that have a label.
pub fn train_flowering_model(
    season: &str,
    features: &PlotTable,
    labels: &HashMap<String, f64>,
    config: &RegressionConfig,
) -> Result<TrainedModel, RegressionError> {
    // 1. Labelled plots, in table order.
    let rows: Vec<usize> = features
        .plot_ids()
        .iter()
        .enumerate()
        .filter(|(_, id)| labels.get(id.as_str()).is_some_and(|y| y.is_finite()))
        .map(|(i, _)| i)
        .collect();
    let required = (config.folds + 2).max(4);
    if rows.len() < required {
        return Err(RegressionError::TooFewObservations {
            found: rows.len(),
            required,
        });
    }
    let labelled = features.select_rows(&rows);
    let ids = labelled.plot_ids().to_vec();
    let y: Array1<f64> = ids.iter().map(|id| labels[id.as_str()]).collect();
    let names = labelled.names().to_vec();
    let x = labelled.matrix(&names)?;
    log::info!(
        "Training on {} labelled plots with {} candidate features",
        ids.len(),
        names.len()
    );

    // 2. Stratified split.
    let y_values = y.to_vec();
    let split = stratified_split(&y_values, config.train_fraction, config.strata_bins, config.seed)?;
    let x_train = x.select(Axis(0), &split.train);
    let y_train = y.select(Axis(0), &split.train);
    let x_test = x.select(Axis(0), &split.test);
    let y_test = y.select(Axis(0), &split.test);

    // 3. Penalty tuning inside the training partition.
    let folds = stratified_folds(
        &y_train.to_vec(),
        config.folds,
        config.strata_bins,
        config.seed.wrapping_add(1),
    )?;
    let cv = cross_validate(
        &x_train,
        &y_train,
        &names,
        &folds,
        &config.grid,
        &config.nzv,
        &config.lasso,
    )?;

    // 4. Refit on the whole training partition.
    let recipe = Recipe::fit(&x_train, &names, &config.nzv)?;
    let prepared_train = recipe.apply(&x_train)?;
    let fit = fit_lasso(&prepared_train, &y_train, cv.best_alpha, &config.lasso, None);
    log::info!(
        "Final model keeps {} of {} features",
        fit.n_nonzero(),
        recipe.kept.len()
    );

    // 5. One look at the test partition.
    let predicted = fit.predict(&recipe.apply(&x_test)?);
    let metrics = EvaluationMetrics::compute(&y_test.to_vec(), &predicted.to_vec());
    log::info!(
        "Test partition (n = {}): R² = {}, Spearman = {}, RMSE = {}",
        metrics.n,
        format_metric(metrics.rsq),
        format_metric(metrics.spearman),
        format_metric(metrics.rmse)
    );

    let test_predictions = split
        .test
        .iter()
        .zip(predicted.iter())
        .map(|(&i, &p)| TestPrediction {
            plot_id: ids[i].clone(),
            observed_gdd: y[i],
            predicted_gdd: p,
        })
        .collect();

    Ok(TrainedModel {
        season: season.to_string(),
        alpha: cv.best_alpha,
        intercept: fit.intercept,
        n_train: split.train.len(),
        n_test: split.test.len(),
        coefficients: fit.coefficients.to_vec(),
        recipe,
        metrics,
        cv_curve: cv.curve,
        test_predictions,
    })
}

fn format_metric(value: Option<f64>) -> String {
    value.map_or_else(|| "undefined".to_string(), |v| format!("{v:.4}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn labelled_table(n: usize, seed: u64) -> (PlotTable, HashMap<String, f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let ids: Vec<String> = (0..n).map(|i| format!("plot{i:03}")).collect();
        let names: Vec<String> = (0..5).map(|j| format!("feature_{j}")).collect();
        let columns: Vec<Vec<f64>> = (0..5)
            .map(|_| (0..n).map(|_| normal.sample(&mut rng)).collect())
            .collect();
        let labels = ids
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 5 != 0)
            .map(|(i, id)| {
                let y = 1250.0 + 30.0 * columns[1][i] + 3.0 * normal.sample(&mut rng);
                (id.clone(), y)
            })
            .collect();
        (PlotTable::new(ids, names, columns).unwrap(), labels)
    }

    #[test]
    fn trains_on_labelled_plots_only() {
        let (table, labels) = labelled_table(120, 8);
        let model =
            train_flowering_model("2022", &table, &labels, &RegressionConfig::default()).unwrap();
        assert_eq!(model.n_train + model.n_test, 96);
        assert_eq!(model.test_predictions.len(), model.n_test);
        assert!(model.metrics.rsq.unwrap() > 0.8);
        assert!(model.metrics.spearman.unwrap() > 0.8);
        assert_eq!(model.nonzero_coefficients()[0].feature, "feature_1");
        assert_eq!(model.cv_curve.len(), 50);
    }

    #[test]
    fn too_few_labels_is_an_error() {
        let (table, mut labels) = labelled_table(40, 1);
        labels.retain(|id, _| id.as_str() < "plot010");
        let err = train_flowering_model("2022", &table, &labels, &RegressionConfig::default())
            .unwrap_err();
        assert!(matches!(err, RegressionError::TooFewObservations { .. }));
    }
}
