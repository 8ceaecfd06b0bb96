// mixed/heritability.rs

//! # Broad-Sense Heritability of Drone Features
//!
//! Every candidate feature is treated as a trait and fitted with
//! `trait ~ 1 + (1 | genotype) + (1 | replicate)` on the plots of one reference
//! experiment. Heritability follows the Cullis definition
//!
//! ```text
//! H2 = 1 - SED^2 / (2 * Vg)
//! ```
//!
//! where `SED` is the mean standard error of the differences between predicted
//! genotype means and `Vg` the genetic variance component.
//!
//! Features are independent, so the batch is fitted in parallel. A failed fit
//! never aborts the batch: it becomes a record with `h2 = None` and a status.

use super::reml::{MixedModelError, RandomFactor, RemlOptions, fit_reml};
use crate::features::FeatureName;
use crate::stats;
use crate::table::{DesignTable, PlotTable};
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use natord::compare;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::IsTerminal;

pub const GENOTYPE: &str = "genotype";
pub const REPLICATE: &str = "replicate";

/// Settings of the per-season heritability screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeritabilityConfig {
    /// Experiment whose plots are used. `None` uses every plot with a design record.
    pub reference_experiment: Option<String>,
    /// A feature is screened if its name contains any of these markers.
    pub feature_markers: Vec<String>,
    pub reml: RemlOptions,
}

impl Default for HeritabilityConfig {
    fn default() -> Self {
        Self {
            reference_experiment: None,
            feature_markers: vec!["q50".to_string(), "canopy_area".to_string()],
            reml: RemlOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeritabilityStatus {
    Estimated,
    /// The estimate is below zero; the value is kept for inspection.
    NegativeEstimate,
    NotConverged,
    Failed,
}

/// One row of `heritability.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeritabilityRecord {
    pub feature: String,
    pub feature_type: String,
    pub acquisition_date: Option<NaiveDate>,
    pub h2: Option<f64>,
    pub genetic_variance: Option<f64>,
    pub replicate_variance: Option<f64>,
    pub residual_variance: Option<f64>,
    pub mean_sed: Option<f64>,
    pub n_observations: usize,
    pub status: HeritabilityStatus,
    pub message: Option<String>,
}

impl HeritabilityRecord {
    fn undefined(name: &str, n_observations: usize, error: &MixedModelError) -> Self {
        let status = match error {
            MixedModelError::NotConverged(_) => HeritabilityStatus::NotConverged,
            _ => HeritabilityStatus::Failed,
        };
        let parsed = FeatureName::parse(name);
        Self {
            feature: name.to_string(),
            feature_type: parsed.feature_type,
            acquisition_date: parsed.acquisition_date,
            h2: None,
            genetic_variance: None,
            replicate_variance: None,
            residual_variance: None,
            mean_sed: None,
            n_observations,
            status,
            message: Some(error.to_string()),
        }
    }
}

/// Cullis heritability from the mean SED of genotype differences and the
/// genetic variance.
pub fn cullis_h2(mean_sed: f64, genetic_variance: f64) -> f64 {
    1.0 - mean_sed * mean_sed / (2.0 * genetic_variance)
}

/// Status of a fitted estimate. A non-finite value is never reported as estimated.
fn status_of(h2: f64) -> HeritabilityStatus {
    if !h2.is_finite() {
        HeritabilityStatus::Failed
    } else if h2 < 0.0 {
        HeritabilityStatus::NegativeEstimate
    } else {
        HeritabilityStatus::Estimated
    }
}

/// Fits one feature. `y` may contain `NaN` for plots without a value.
pub fn estimate_feature(
    name: &str,
    y: &[f64],
    genotypes: &[String],
    replicates: &[String],
    options: &RemlOptions,
) -> HeritabilityRecord {
    let observed = y.iter().filter(|v| v.is_finite()).count();
    let factors = [
        RandomFactor::new(GENOTYPE, genotypes.to_vec()),
        RandomFactor::new(REPLICATE, replicates.to_vec()),
    ];

    let fitted = fit_reml(y, &factors, options).and_then(|fit| {
        let predictions = fit.predict_level_means(GENOTYPE)?;
        Ok((fit, predictions.mean_sed))
    });

    match fitted {
        Ok((fit, mean_sed)) => {
            let vg = fit.variance(GENOTYPE).unwrap_or(f64::NAN);
            let h2 = cullis_h2(mean_sed, vg);
            let status = status_of(h2);
            let message = match status {
                HeritabilityStatus::NegativeEstimate => {
                    log::warn!("Feature '{name}' has a negative heritability estimate ({h2:.4})");
                    None
                }
                HeritabilityStatus::Failed => {
                    log::debug!("Heritability of '{name}' is not finite");
                    Some(format!(
                        "heritability is not finite (mean SED {mean_sed}, genetic variance {vg})"
                    ))
                }
                _ => None,
            };
            let parsed = FeatureName::parse(name);
            HeritabilityRecord {
                feature: name.to_string(),
                feature_type: parsed.feature_type,
                acquisition_date: parsed.acquisition_date,
                h2: h2.is_finite().then_some(h2),
                genetic_variance: Some(vg),
                replicate_variance: fit.variance(REPLICATE),
                residual_variance: Some(fit.residual_variance),
                mean_sed: Some(mean_sed),
                n_observations: fit.n_observations,
                status,
                message,
            }
        }
        Err(e) => {
            log::debug!("Heritability of '{name}' is undefined: {e}");
            HeritabilityRecord::undefined(name, observed, &e)
        }
    }
}

/// Screens every matching feature of the reference experiment. Records are
/// returned in natural order of feature name.
pub fn estimate_heritability(
    features: &PlotTable,
    design: &DesignTable,
    config: &HeritabilityConfig,
) -> Vec<HeritabilityRecord> {
    // 1. Plots of the reference experiment that have a design record.
    let rows: Vec<usize> = features
        .plot_ids()
        .iter()
        .enumerate()
        .filter_map(|(row, id)| {
            let record = design.get(id)?;
            let selected = match &config.reference_experiment {
                Some(experiment) => record.experiment.as_deref() == Some(experiment.as_str()),
                None => true,
            };
            selected.then_some(row)
        })
        .collect();
    let ids = features.plot_ids();
    let mut genotypes = Vec::with_capacity(rows.len());
    let mut replicates = Vec::with_capacity(rows.len());
    for &row in &rows {
        if let Some(record) = design.get(&ids[row]) {
            genotypes.push(record.pedigree.clone());
            replicates.push(record.replicate.clone());
        }
    }

    // 2. Candidate columns.
    let candidates: Vec<(&str, &[f64])> = features
        .iter_columns()
        .filter(|(name, _)| config.feature_markers.iter().any(|m| name.contains(m.as_str())))
        .collect();
    log::info!(
        "Estimating heritability for {} features on {} plots",
        candidates.len(),
        rows.len()
    );

    // 3. Independent fits.
    let pb = create_progress_bar(candidates.len() as u64, "Fitting mixed models");
    let mut records: Vec<HeritabilityRecord> = candidates
        .par_iter()
        .map(|(name, values)| {
            let y: Vec<f64> = rows.iter().map(|&r| values[r]).collect();
            let record = estimate_feature(name, &y, &genotypes, &replicates, &config.reml);
            pb.inc(1);
            record
        })
        .collect();
    pb.finish_and_clear();

    records.sort_by(|a, b| compare(&a.feature, &b.feature));

    let defined = records.iter().filter(|r| r.h2.is_some()).count();
    log::info!(
        "Heritability defined for {defined} of {} features",
        records.len()
    );
    records
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

// --- Summaries ---

/// Box-plot statistics of heritability per feature type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub feature_type: String,
    pub n_features: usize,
    pub n_defined: usize,
    pub min: Option<f64>,
    pub q1: Option<f64>,
    pub median: Option<f64>,
    pub q3: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

pub fn summarize_by_type(records: &[HeritabilityRecord]) -> Vec<TypeSummary> {
    let mut groups: BTreeMap<&str, Vec<Option<f64>>> = BTreeMap::new();
    for record in records {
        groups.entry(&record.feature_type).or_default().push(record.h2);
    }

    let mut summaries: Vec<TypeSummary> = groups
        .into_iter()
        .map(|(feature_type, values)| {
            let mut defined: Vec<f64> = values.iter().flatten().copied().collect();
            defined.sort_by(f64::total_cmp);
            TypeSummary {
                feature_type: feature_type.to_string(),
                n_features: values.len(),
                n_defined: defined.len(),
                min: defined.first().copied(),
                q1: stats::quantile_sorted(&defined, 0.25),
                median: stats::quantile_sorted(&defined, 0.5),
                q3: stats::quantile_sorted(&defined, 0.75),
                max: defined.last().copied(),
                mean: stats::mean(&defined),
            }
        })
        .collect();
    summaries.sort_by(|a, b| compare(&a.feature_type, &b.feature_type));
    summaries
}

/// One point of the heritability-over-time scatter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimePoint {
    pub acquisition_date: NaiveDate,
    pub feature_type: String,
    pub feature: String,
    pub h2: f64,
}

/// Dated features with a defined estimate, ordered by date then feature type.
pub fn heritability_over_time(records: &[HeritabilityRecord]) -> Vec<TimePoint> {
    let mut points: Vec<TimePoint> = records
        .iter()
        .filter_map(|r| {
            Some(TimePoint {
                acquisition_date: r.acquisition_date?,
                feature_type: r.feature_type.clone(),
                feature: r.feature.clone(),
                h2: r.h2?,
            })
        })
        .collect();
    points.sort_by(|a, b| {
        a.acquisition_date
            .cmp(&b.acquisition_date)
            .then_with(|| compare(&a.feature_type, &b.feature_type))
    });
    points
}
