//! Agreement between observed and predicted flowering times.
//!
//! `rsq` is the squared Pearson correlation, the definition used for penalty
//! selection. It is undefined (`None`) when either side is constant, which is
//! what an intercept-only model produces at large penalties.

use crate::stats;
use serde::{Deserialize, Serialize};

/// Squared correlation between observed and predicted values.
pub fn rsq(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    stats::pearson(observed, predicted).map(|r| r * r)
}

/// `1 - SSE/SST`. Can be negative. `None` for constant observations.
pub fn rsq_trad(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    if observed.len() != predicted.len() || observed.len() < 2 {
        return None;
    }
    let m = stats::mean(observed)?;
    let sst: f64 = observed.iter().map(|y| (y - m).powi(2)).sum();
    if sst <= 0.0 {
        return None;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Some(1.0 - sse / sst)
}

pub fn rmse(observed: &[f64], predicted: &[f64]) -> Option<f64> {
    if observed.len() != predicted.len() || observed.is_empty() {
        return None;
    }
    let sse: f64 = observed
        .iter()
        .zip(predicted)
        .map(|(y, p)| (y - p).powi(2))
        .sum();
    Some((sse / observed.len() as f64).sqrt())
}

/// Held-out evaluation of a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub n: usize,
    pub rsq: Option<f64>,
    pub rsq_trad: Option<f64>,
    pub rmse: Option<f64>,
    pub spearman: Option<f64>,
}

impl EvaluationMetrics {
    pub fn compute(observed: &[f64], predicted: &[f64]) -> Self {
        Self {
            n: observed.len(),
            rsq: rsq(observed, predicted),
            rsq_trad: rsq_trad(observed, predicted),
            rmse: rmse(observed, predicted),
            spearman: stats::spearman(observed, predicted),
        }
    }
}
