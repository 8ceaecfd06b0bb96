//! Descriptive statistics over plain slices.
//!
//! Missing values are `NaN` throughout the crate; helpers named `*_finite`
//! ignore them, everything else expects complete input.

/// Finite values of `values`, in order.
pub fn finite(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| v.is_finite()).collect()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample variance (denominator `n - 1`).
pub fn sample_variance(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some(ss / (values.len() - 1) as f64)
}

/// Quantile of already sorted data, linear interpolation between order
/// statistics (the default "type 7" definition).
pub fn quantile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

/// Quantile of the finite values of `values`.
pub fn quantile_finite(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted = finite(values);
    sorted.sort_by(f64::total_cmp);
    quantile_sorted(&sorted, p)
}

pub fn median_finite(values: &[f64]) -> Option<f64> {
    quantile_finite(values, 0.5)
}

/// Pearson correlation. `None` when either input has zero variance or the
/// lengths differ.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= 0.0 || syy <= 0.0 {
        return None;
    }
    let r = sxy / (sxx.sqrt() * syy.sqrt());
    r.is_finite().then_some(r.clamp(-1.0, 1.0))
}

/// 1-based ranks with ties sharing their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end share ranks start+1..=end.
        let shared = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = shared;
        }
        start = end;
    }
    ranks
}

/// Spearman rank correlation: Pearson correlation of average ranks.
pub fn spearman(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() {
        return None;
    }
    pearson(&average_ranks(x), &average_ranks(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn quantiles_interpolate_between_order_statistics() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5).unwrap(), 2.5);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.25).unwrap(), 1.75);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 1.0).unwrap(), 4.0);
        assert!(quantile_sorted(&[], 0.5).is_none());
        assert_abs_diff_eq!(median_finite(&[5.0, f64::NAN, 1.0, 3.0]).unwrap(), 3.0);
    }

    #[test]
    fn ties_share_average_ranks() {
        let ranks = average_ranks(&[10.0, 20.0, 10.0, 30.0]);
        assert_eq!(ranks, vec![1.5, 3.0, 1.5, 4.0]);
    }

    #[test]
    fn spearman_is_one_for_monotone_relationships() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 8.0, 27.0, 64.0, 125.0];
        assert_abs_diff_eq!(spearman(&x, &y).unwrap(), 1.0, epsilon = 1e-12);
        let reversed: Vec<f64> = y.iter().rev().copied().collect();
        assert_abs_diff_eq!(spearman(&x, &reversed).unwrap(), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn correlation_is_undefined_for_constant_input() {
        let x = [1.0, 2.0, 3.0];
        let constant = [4.0, 4.0, 4.0];
        assert!(pearson(&x, &constant).is_none());
        assert!(spearman(&x, &constant).is_none());
    }

    #[test]
    fn sample_variance_uses_n_minus_one() {
        assert_abs_diff_eq!(sample_variance(&[1.0, 2.0, 3.0, 4.0]).unwrap(), 5.0 / 3.0);
        assert!(sample_variance(&[1.0]).is_none());
    }
}
