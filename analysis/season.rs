//! # Season Orchestration
//!
//! A season is processed as a straight pipeline:
//!
//! 1. load the drone summary and the trial design,
//! 2. engineer plant-height features,
//! 3. screen feature heritability on the reference experiment,
//! 4. train and evaluate the flowering-time model,
//! 5. predict unlabelled plots, minus the exclusion list,
//! 6. write diagnostics and reports.
//!
//! Each stage is also exposed on its own for the command line. Any error stops
//! the run; the only tolerated failures are per-feature heritability fits and
//! degenerate cross-validation folds, which are recorded as undefined values.

use crate::config::SeasonConfig;
use crate::diagnostics::{replicate_concordance, spatial_grid};
use crate::features::{EngineeringReport, FeatureError, engineer_features};
use crate::inference::{PredictionRecord, predict_unlabeled};
use crate::mixed::heritability::{
    HeritabilityRecord, estimate_heritability, heritability_over_time, summarize_by_type,
};
use crate::regress::RegressionError;
use crate::regress::metrics::EvaluationMetrics;
use crate::regress::model::{ModelError, TrainedModel};
use crate::regress::train::train_flowering_model;
use crate::report::{self, ReportError, ReportWriter};
use crate::table::{DataError, DesignTable, PlotTable, load_design_table, load_feature_table};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SeasonError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Regression(#[from] RegressionError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(
        "The feature table and the design share no plot IDs; check `inputs.feature_id_column` and `design_columns.plot_id`."
    )]
    NoSharedPlots,
}

/// Engineered features and design of one season.
#[derive(Debug, Clone)]
pub struct SeasonInputs {
    pub features: PlotTable,
    pub engineering: EngineeringReport,
    pub design: DesignTable,
}

impl SeasonInputs {
    pub fn load(config: &SeasonConfig) -> Result<Self, SeasonError> {
        log::info!(
            "Season {}: loading {} and {}",
            config.season,
            config.inputs.features.display(),
            config.inputs.design.display()
        );
        let raw = load_feature_table(&config.inputs.features, &config.inputs.feature_id_column)?;
        let design = load_design_table(&config.inputs.design, &config.design_columns)?;

        let unmatched = raw
            .plot_ids()
            .iter()
            .filter(|id| design.get(id).is_none())
            .count();
        if unmatched == raw.n_plots() {
            return Err(SeasonError::NoSharedPlots);
        }
        if unmatched > 0 {
            log::warn!("{unmatched} plots of the feature table have no design record");
        }

        let (features, engineering) = engineer_features(&raw, &config.features)?;
        log::info!(
            "Engineered {} features for {} plots ({} height columns derived, {} soil and {} constant columns dropped)",
            features.n_columns(),
            features.n_plots(),
            engineering.derived_heights.len(),
            engineering.dropped_soil.len(),
            engineering.dropped_constant.len()
        );
        Ok(Self {
            features,
            engineering,
            design,
        })
    }

    /// Labels of the plots used for training.
    pub fn training_labels(&self, config: &SeasonConfig) -> HashMap<String, f64> {
        let mut labels = self.design.labels();
        let experiments = &config.regression.experiments;
        if !experiments.is_empty() {
            let allowed = self.design.plots_in_experiments(experiments);
            labels.retain(|id, _| allowed.contains(id));
        }
        labels
    }

    /// Feature rows eligible for inference: the training experiments, or every
    /// plot when no experiment filter is configured.
    pub fn inference_table(&self, config: &SeasonConfig) -> PlotTable {
        let experiments = &config.regression.experiments;
        if experiments.is_empty() {
            return self.features.clone();
        }
        let allowed = self.design.plots_in_experiments(experiments);
        self.features.retain_plots(|id| allowed.contains(id))
    }
}

/// Key results of a full season run.
#[derive(Debug, Clone)]
pub struct SeasonSummary {
    pub season: String,
    pub n_plots: usize,
    pub n_features: usize,
    pub heritability_defined: usize,
    pub heritability_total: usize,
    pub alpha: f64,
    pub test_metrics: EvaluationMetrics,
    pub n_predicted: usize,
}

pub fn run_features(config: &SeasonConfig) -> Result<SeasonInputs, SeasonError> {
    let inputs = SeasonInputs::load(config)?;
    let writer = ReportWriter::create(&config.output_dir)?;
    writer.write_table(report::FEATURES, &inputs.features)?;
    Ok(inputs)
}

pub fn run_heritability(
    config: &SeasonConfig,
    inputs: &SeasonInputs,
) -> Result<Vec<HeritabilityRecord>, SeasonError> {
    let records = estimate_heritability(&inputs.features, &inputs.design, &config.heritability);
    let writer = ReportWriter::create(&config.output_dir)?;
    writer.write_rows(report::HERITABILITY, &records)?;
    writer.write_rows(report::HERITABILITY_BY_TYPE, &summarize_by_type(&records))?;
    writer.write_rows(report::HERITABILITY_OVER_TIME, &heritability_over_time(&records))?;
    Ok(records)
}

pub fn run_training(config: &SeasonConfig, inputs: &SeasonInputs) -> Result<TrainedModel, SeasonError> {
    let labels = inputs.training_labels(config);
    let model = train_flowering_model(&config.season, &inputs.features, &labels, &config.regression)?;

    let writer = ReportWriter::create(&config.output_dir)?;
    writer.write_model(&model)?;
    writer.write_rows(report::CV_CURVE, &model.cv_curve)?;
    writer.write_rows(report::COEFFICIENTS, &model.nonzero_coefficients())?;
    writer.write_rows(report::TEST_PREDICTIONS, &model.test_predictions)?;
    Ok(model)
}

pub fn run_inference(
    config: &SeasonConfig,
    inputs: &SeasonInputs,
    model: &TrainedModel,
) -> Result<Vec<PredictionRecord>, SeasonError> {
    let labels = inputs.design.labels();
    let exclusions: HashSet<String> = config.inference.exclude_plots.iter().cloned().collect();
    let targets = inputs.inference_table(config);
    let predictions = predict_unlabeled(model, &targets, &labels, &exclusions)?;

    let concordance = replicate_concordance(&predictions, &inputs.design);
    let map = spatial_grid(&predictions, &inputs.design);

    let writer = ReportWriter::create(&config.output_dir)?;
    writer.write_rows(report::PREDICTIONS, &predictions)?;
    writer.write_rows(report::REPLICATE_PAIRS, &concordance.pairs)?;
    writer.write_rows(report::REPLICATE_CONCORDANCE, &concordance.summary)?;
    writer.write_rows(report::SPATIAL_MAP, &map.cells())?;
    Ok(predictions)
}

/// Loads a saved model bundle and predicts the season's unlabelled plots.
pub fn run_inference_from_file(
    config: &SeasonConfig,
    model_path: &Path,
) -> Result<Vec<PredictionRecord>, SeasonError> {
    let inputs = SeasonInputs::load(config)?;
    let model = TrainedModel::load(model_path)?;
    if model.season != config.season {
        log::warn!(
            "Model was trained on season {} but is applied to season {}",
            model.season,
            config.season
        );
    }
    run_inference(config, &inputs, &model)
}

/// Runs every stage of one season and writes all outputs.
pub fn run_season(config: &SeasonConfig) -> Result<SeasonSummary, SeasonError> {
    let inputs = run_features(config)?;
    let heritability = run_heritability(config, &inputs)?;
    let model = run_training(config, &inputs)?;
    let predictions = run_inference(config, &inputs, &model)?;

    let summary = SeasonSummary {
        season: config.season.clone(),
        n_plots: inputs.features.n_plots(),
        n_features: inputs.features.n_columns(),
        heritability_defined: heritability.iter().filter(|r| r.h2.is_some()).count(),
        heritability_total: heritability.len(),
        alpha: model.alpha,
        test_metrics: model.metrics.clone(),
        n_predicted: predictions.len(),
    };
    log::info!(
        "Season {} complete: {} predictions written to {}",
        summary.season,
        summary.n_predicted,
        config.output_dir.display()
    );
    Ok(summary)
}
