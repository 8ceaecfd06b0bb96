//! Label-stratified partitioning.
//!
//! Labels are cut into quantile strata so that both sides of a split, and
//! every cross-validation fold, see the whole range of flowering times.

use super::RegressionError;
use crate::stats;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Row indices of a train/test partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Assigns every label to one of at most `bins` quantile strata. Duplicate
/// breakpoints collapse, so heavily tied labels produce fewer strata.
pub fn quantile_strata(labels: &[f64], bins: usize) -> Vec<usize> {
    let mut sorted = labels.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut breaks: Vec<f64> = (1..bins.max(1))
        .filter_map(|i| stats::quantile_sorted(&sorted, i as f64 / bins as f64))
        .collect();
    breaks.dedup();

    // Right-closed intervals: (b_{i-1}, b_i].
    labels
        .iter()
        .map(|&y| breaks.iter().filter(|&&b| b < y).count())
        .collect()
}

fn group_by_stratum(strata: &[usize]) -> Vec<Vec<usize>> {
    let n_strata = strata.iter().copied().max().map_or(0, |m| m + 1);
    let mut groups = vec![Vec::new(); n_strata];
    for (i, &s) in strata.iter().enumerate() {
        groups[s].push(i);
    }
    groups.retain(|g| !g.is_empty());
    groups
}

/// Splits `labels` into train and test indices, drawing `train_fraction` of
/// each stratum (rounded) into the training set. Both lists are sorted.
pub fn stratified_split(
    labels: &[f64],
    train_fraction: f64,
    bins: usize,
    seed: u64,
) -> Result<Split, RegressionError> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(RegressionError::InvalidSetting(format!(
            "train fraction must lie in (0, 1), got {train_fraction}"
        )));
    }
    if labels.len() < 2 {
        return Err(RegressionError::TooFewObservations {
            found: labels.len(),
            required: 2,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for mut group in group_by_stratum(&quantile_strata(labels, bins)) {
        group.shuffle(&mut rng);
        let n_train = (group.len() as f64 * train_fraction).round() as usize;
        let (head, tail) = group.split_at(n_train.min(group.len()));
        train.extend_from_slice(head);
        test.extend_from_slice(tail);
    }

    if train.is_empty() || test.is_empty() {
        return Err(RegressionError::TooFewObservations {
            found: labels.len(),
            required: 2,
        });
    }
    train.sort_unstable();
    test.sort_unstable();
    log::debug!("Stratified split: {} train, {} test", train.len(), test.len());
    Ok(Split { train, test })
}

/// Assigns rows to `k` folds, dealing each shuffled stratum round-robin so
/// strata are spread evenly. Returns the held-out indices of every fold.
pub fn stratified_folds(
    labels: &[f64],
    k: usize,
    bins: usize,
    seed: u64,
) -> Result<Vec<Vec<usize>>, RegressionError> {
    if k < 2 {
        return Err(RegressionError::InvalidSetting(format!(
            "at least 2 folds are required, got {k}"
        )));
    }
    if labels.len() < k {
        return Err(RegressionError::TooFewObservations {
            found: labels.len(),
            required: k,
        });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut next = 0;
    for mut group in group_by_stratum(&quantile_strata(labels, bins)) {
        group.shuffle(&mut rng);
        for i in group {
            folds[next].push(i);
            next = (next + 1) % k;
        }
    }
    for fold in &mut folds {
        fold.sort_unstable();
    }
    Ok(folds)
}

/// Indices in `0..n` that are not in `held_out` (which must be sorted).
pub fn complement(n: usize, held_out: &[usize]) -> Vec<usize> {
    (0..n).filter(|i| held_out.binary_search(i).is_err()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn labels(n: usize) -> Vec<f64> {
        (0..n).map(|i| 1200.0 + (i * 37 % 101) as f64).collect()
    }

    #[test]
    fn split_is_a_partition_and_preserves_strata() {
        let y = labels(100);
        let split = stratified_split(&y, 0.75, 4, 42).unwrap();
        assert_eq!(split.train.len() + split.test.len(), 100);
        let all: HashSet<usize> = split.train.iter().chain(&split.test).copied().collect();
        assert_eq!(all.len(), 100);
        // Four strata of 25, each contributing round(18.75) = 19 training rows.
        assert_eq!(split.train.len(), 76);

        let strata = quantile_strata(&y, 4);
        for s in 0..4 {
            let in_train = split.train.iter().filter(|&&i| strata[i] == s).count();
            let total = strata.iter().filter(|&&x| x == s).count();
            assert_eq!(in_train, (total as f64 * 0.75).round() as usize);
        }
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        let y = labels(60);
        assert_eq!(
            stratified_split(&y, 0.75, 4, 7).unwrap(),
            stratified_split(&y, 0.75, 4, 7).unwrap()
        );
        assert_ne!(
            stratified_split(&y, 0.75, 4, 7).unwrap(),
            stratified_split(&y, 0.75, 4, 8).unwrap()
        );
    }

    #[test]
    fn folds_cover_every_row_once() {
        let y = labels(53);
        let folds = stratified_folds(&y, 10, 4, 1).unwrap();
        assert_eq!(folds.len(), 10);
        let mut seen: Vec<usize> = folds.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..53).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() == 5 || f.len() == 6));
        assert_eq!(complement(53, &folds[0]).len(), 53 - folds[0].len());
    }

    #[test]
    fn tied_labels_collapse_strata() {
        let strata = quantile_strata(&[5.0; 10], 4);
        assert!(strata.iter().all(|&s| s == 0));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let y = labels(20);
        assert!(matches!(
            stratified_split(&y, 1.0, 4, 0),
            Err(RegressionError::InvalidSetting(_))
        ));
        assert!(matches!(
            stratified_folds(&y[..5], 10, 4, 0),
            Err(RegressionError::TooFewObservations { .. })
        ));
    }
}
