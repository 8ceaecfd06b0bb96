//! Prediction of flowering time for plots without a ground-truth score.
//!
//! The trained model is applied as stored; nothing is refitted on the plots it
//! predicts. Plots on the season's exclusion list are dropped beforehand.

use crate::regress::model::{ModelError, TrainedModel};
use crate::table::PlotTable;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// One row of `predictions.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub plot_id: String,
    pub predicted_gdd: f64,
}

/// Predicts every plot of `features` that has no label and is not excluded.
/// Records follow table order.
pub fn predict_unlabeled(
    model: &TrainedModel,
    features: &PlotTable,
    labels: &HashMap<String, f64>,
    exclusions: &HashSet<String>,
) -> Result<Vec<PredictionRecord>, ModelError> {
    let unknown: Vec<&String> = exclusions
        .iter()
        .filter(|id| features.row_of(id).is_none())
        .collect();
    if !unknown.is_empty() {
        log::warn!(
            "{} excluded plot(s) are not in the feature table: {:?}",
            unknown.len(),
            unknown
        );
    }

    let (rows, excluded) = inference_rows(features, labels, exclusions);
    let targets = features.select_rows(&rows);
    log::info!(
        "Predicting {} unlabelled plots ({excluded} excluded)",
        targets.n_plots()
    );

    let predicted = model.predict(&targets)?;
    Ok(targets
        .plot_ids()
        .iter()
        .zip(predicted.iter())
        .map(|(id, &p)| PredictionRecord {
            plot_id: id.clone(),
            predicted_gdd: p,
        })
        .collect())
}

/// Rows of unlabelled plots that are not excluded, plus the number of
/// unlabelled rows the exclusion list removed.
fn inference_rows(
    features: &PlotTable,
    labels: &HashMap<String, f64>,
    exclusions: &HashSet<String>,
) -> (Vec<usize>, usize) {
    let mut rows = Vec::new();
    let mut excluded = 0;
    for (i, id) in features.plot_ids().iter().enumerate() {
        if labels.contains_key(id.as_str()) {
            continue;
        }
        if exclusions.contains(id.as_str()) {
            excluded += 1;
        } else {
            rows.push(i);
        }
    }
    (rows, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PlotTable {
        PlotTable::new(
            vec!["A".into(), "B".into(), "C".into(), "D".into()],
            vec!["height_q95".into()],
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        )
        .unwrap()
    }

    #[test]
    fn only_unlabelled_plots_count_as_excluded() {
        let labels: HashMap<String, f64> = [("A".to_string(), 1300.0)].into_iter().collect();
        // "A" is labelled and "Z" is not in the table: neither removes a row.
        let exclusions: HashSet<String> = ["A", "C", "Z"].iter().map(|s| s.to_string()).collect();

        let (rows, excluded) = inference_rows(&table(), &labels, &exclusions);
        assert_eq!(rows, vec![1, 3]);
        assert_eq!(excluded, 1);
    }

    #[test]
    fn without_exclusions_every_unlabelled_plot_is_kept() {
        let (rows, excluded) = inference_rows(&table(), &HashMap::new(), &HashSet::new());
        assert_eq!(rows, vec![0, 1, 2, 3]);
        assert_eq!(excluded, 0);
    }
}
