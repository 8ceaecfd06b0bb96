//! # Prediction Diagnostics
//!
//! Predictions joined back to the trial design for two visual checks: how well
//! replicates of the same genotype agree, and whether predictions follow a
//! spatial pattern across the field. Nothing here feeds back into the model.

use crate::inference::PredictionRecord;
use crate::stats;
use crate::table::DesignTable;
use itertools::Itertools;
use natord::compare;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Genotype-matched predictions from two replicates (`replicate_pairs.csv`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicatePair {
    pub genotype: String,
    pub replicate_a: String,
    pub replicate_b: String,
    pub predicted_a: f64,
    pub predicted_b: f64,
}

/// Agreement between two replicates (`replicate_concordance.csv`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConcordanceRow {
    pub replicate_a: String,
    pub replicate_b: String,
    pub n_genotypes: usize,
    pub pearson: Option<f64>,
    pub spearman: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicateConcordance {
    pub pairs: Vec<ReplicatePair>,
    pub summary: Vec<ConcordanceRow>,
}

/// Correlates predictions of the same genotype across every pair of
/// replicates. A genotype with several plots in one replicate contributes
/// their mean. Plots without a design record are ignored.
pub fn replicate_concordance(
    predictions: &[PredictionRecord],
    design: &DesignTable,
) -> ReplicateConcordance {
    // replicate -> genotype -> (sum, count)
    let mut by_replicate: HashMap<&str, HashMap<&str, (f64, usize)>> = HashMap::new();
    for prediction in predictions {
        if let Some(record) = design.get(&prediction.plot_id) {
            let slot = by_replicate
                .entry(record.replicate.as_str())
                .or_default()
                .entry(record.pedigree.as_str())
                .or_insert((0.0, 0));
            slot.0 += prediction.predicted_gdd;
            slot.1 += 1;
        }
    }

    let mut replicates: Vec<&str> = by_replicate.keys().copied().collect();
    replicates.sort_by(|a, b| compare(a, b));

    let mut result = ReplicateConcordance::default();
    for (rep_a, rep_b) in replicates.iter().tuple_combinations() {
        let (Some(a), Some(b)) = (by_replicate.get(rep_a), by_replicate.get(rep_b)) else {
            continue;
        };
        let mut shared: Vec<&str> = a.keys().filter(|g| b.contains_key(*g)).copied().collect();
        shared.sort_by(|x, y| compare(x, y));

        let mut values_a = Vec::with_capacity(shared.len());
        let mut values_b = Vec::with_capacity(shared.len());
        for genotype in shared {
            let (sum_a, n_a) = a[genotype];
            let (sum_b, n_b) = b[genotype];
            let pa = sum_a / n_a as f64;
            let pb = sum_b / n_b as f64;
            values_a.push(pa);
            values_b.push(pb);
            result.pairs.push(ReplicatePair {
                genotype: genotype.to_string(),
                replicate_a: rep_a.to_string(),
                replicate_b: rep_b.to_string(),
                predicted_a: pa,
                predicted_b: pb,
            });
        }

        let row = ConcordanceRow {
            replicate_a: rep_a.to_string(),
            replicate_b: rep_b.to_string(),
            n_genotypes: values_a.len(),
            pearson: stats::pearson(&values_a, &values_b),
            spearman: stats::spearman(&values_a, &values_b),
        };
        log::debug!(
            "Replicates {} vs {}: {} genotypes, r = {:?}",
            row.replicate_a,
            row.replicate_b,
            row.n_genotypes,
            row.pearson
        );
        result.summary.push(row);
    }
    result
}

/// One cell of the field map (`spatial_map.csv`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpatialCell {
    pub row: i64,
    pub column: i64,
    pub plot_id: Option<String>,
    pub predicted_gdd: Option<f64>,
}

/// Row x column field map. The axes are the row and column numbers used by
/// the trial design, so gaps in field numbering never become empty lines.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialMap {
    pub rows: Vec<i64>,
    pub columns: Vec<i64>,
    cells: BTreeMap<(i64, i64), (String, f64)>,
}

impl SpatialMap {
    pub fn get(&self, row: i64, column: i64) -> Option<f64> {
        self.cells.get(&(row, column)).map(|(_, v)| *v)
    }

    /// Every cell of the grid in row-major order; empty cells have no plot.
    pub fn cells(&self) -> Vec<SpatialCell> {
        self.rows
            .iter()
            .flat_map(|&row| {
                self.columns.iter().map(move |&column| {
                    let hit = self.cells.get(&(row, column));
                    SpatialCell {
                        row,
                        column,
                        plot_id: hit.map(|(id, _)| id.clone()),
                        predicted_gdd: hit.map(|(_, v)| *v),
                    }
                })
            })
            .collect()
    }
}

/// Places predictions on the field grid by design row and column. Design
/// positions without a prediction stay empty; plots without a position are
/// left out.
pub fn spatial_grid(predictions: &[PredictionRecord], design: &DesignTable) -> SpatialMap {
    let mut cells = BTreeMap::new();
    for prediction in predictions {
        let Some(record) = design.get(&prediction.plot_id) else {
            continue;
        };
        if let (Some(row), Some(column)) = (record.row, record.column) {
            if cells
                .insert(
                    (row, column),
                    (prediction.plot_id.clone(), prediction.predicted_gdd),
                )
                .is_some()
            {
                log::warn!("Several plots share field position ({row}, {column})");
            }
        }
    }

    let positions: Vec<(i64, i64)> = design
        .records()
        .iter()
        .filter_map(|r| Some((r.row?, r.column?)))
        .collect();
    let rows: Vec<i64> = positions
        .iter()
        .map(|(r, _)| *r)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let columns: Vec<i64> = positions
        .iter()
        .map(|(_, c)| *c)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    log::debug!(
        "Field map spans {} x {} cells, {} occupied",
        rows.len(),
        columns.len(),
        cells.len()
    );

    SpatialMap {
        rows,
        columns,
        cells,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::DesignRecord;
    use approx::assert_abs_diff_eq;

    fn design() -> DesignTable {
        let mut records = Vec::new();
        for rep in 1..=2 {
            for geno in 0..4 {
                let id = format!("r{rep}g{geno}");
                records.push(DesignRecord {
                    plot_id: id,
                    experiment: Some("YT".to_string()),
                    pedigree: format!("G{geno}"),
                    replicate: rep.to_string(),
                    row: Some(rep),
                    column: Some(geno as i64 + 1),
                    flowering_gdd: None,
                });
            }
        }
        DesignTable::new(records).unwrap()
    }

    fn prediction(id: &str, value: f64) -> PredictionRecord {
        PredictionRecord {
            plot_id: id.to_string(),
            predicted_gdd: value,
        }
    }

    #[test]
    fn replicates_are_matched_by_genotype() {
        let predictions = vec![
            prediction("r1g0", 1200.0),
            prediction("r1g1", 1250.0),
            prediction("r1g2", 1300.0),
            prediction("r2g0", 1210.0),
            prediction("r2g1", 1240.0),
            prediction("r2g2", 1320.0),
            prediction("r2g3", 1400.0),
        ];
        let result = replicate_concordance(&predictions, &design());
        assert_eq!(result.summary.len(), 1);
        let row = &result.summary[0];
        assert_eq!((row.replicate_a.as_str(), row.replicate_b.as_str()), ("1", "2"));
        assert_eq!(row.n_genotypes, 3);
        assert_abs_diff_eq!(row.spearman.unwrap(), 1.0, epsilon = 1e-12);
        assert!(row.pearson.unwrap() > 0.9);
        assert_eq!(result.pairs.len(), 3);
        assert_eq!(result.pairs[1].genotype, "G1");
    }

    #[test]
    fn field_map_leaves_missing_cells_empty() {
        let predictions = vec![prediction("r1g0", 1200.0), prediction("r2g3", 1400.0)];
        let map = spatial_grid(&predictions, &design());
        assert_eq!(map.rows, vec![1, 2]);
        assert_eq!(map.columns, vec![1, 2, 3, 4]);
        assert_eq!(map.get(1, 1), Some(1200.0));
        assert_eq!(map.get(2, 4), Some(1400.0));
        assert_eq!(map.get(1, 2), None);

        let cells = map.cells();
        assert_eq!(cells.len(), 8);
        assert_eq!(cells.iter().filter(|c| c.predicted_gdd.is_some()).count(), 2);
        assert_eq!(cells[0].plot_id.as_deref(), Some("r1g0"));
    }

    #[test]
    fn sparse_field_numbering_keeps_the_map_small() {
        let records = [(1001, 7), (1001, 9), (4020, 7)]
            .iter()
            .enumerate()
            .map(|(i, &(row, column))| DesignRecord {
                plot_id: format!("p{i}"),
                experiment: None,
                pedigree: format!("G{i}"),
                replicate: "1".to_string(),
                row: Some(row),
                column: Some(column),
                flowering_gdd: None,
            })
            .collect();
        let design = DesignTable::new(records).unwrap();
        let map = spatial_grid(&[prediction("p2", 1350.0)], &design);

        assert_eq!(map.rows, vec![1001, 4020]);
        assert_eq!(map.columns, vec![7, 9]);
        assert_eq!(map.cells().len(), 4);
        assert_eq!(map.get(4020, 7), Some(1350.0));
        assert_eq!(map.get(1001, 7), None);
    }
}
