//! # LASSO by Cyclic Coordinate Descent
//!
//! Minimises
//!
//! ```text
//! 1/(2n) * ||y - b0 - X b||^2 + alpha * ||b||_1
//! ```
//!
//! The intercept is unpenalised and handled by centring `X` and `y`. Each
//! coordinate update is a soft-threshold of the partial residual correlation,
//! and the residual vector is updated in place, so one sweep costs `O(n p)`.
//! Along a decreasing penalty path every fit starts from the previous
//! solution, which keeps the number of sweeps small.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LassoOptions {
    pub max_sweeps: usize,
    /// Stop when the largest weighted squared coefficient change of a sweep
    /// falls below this value.
    pub tolerance: f64,
}

impl Default for LassoOptions {
    fn default() -> Self {
        Self {
            max_sweeps: 10_000,
            tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LassoFit {
    pub alpha: f64,
    pub intercept: f64,
    pub coefficients: Array1<f64>,
    pub sweeps: usize,
    pub converged: bool,
}

impl LassoFit {
    pub fn predict(&self, x: &Array2<f64>) -> Array1<f64> {
        x.dot(&self.coefficients) + self.intercept
    }

    pub fn n_nonzero(&self) -> usize {
        self.coefficients.iter().filter(|b| **b != 0.0).count()
    }
}

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

/// Centred copy of `x` and `y` with the removed means.
struct Centered {
    x: Array2<f64>,
    y: Array1<f64>,
    x_means: Array1<f64>,
    y_mean: f64,
    /// `||x_j||^2 / n` of every centred column.
    weights: Array1<f64>,
}

impl Centered {
    fn new(x: &Array2<f64>, y: ArrayView1<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let x_means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let y_mean = y.mean().unwrap_or(0.0);
        let xc = x - &x_means;
        let yc = y.mapv(|v| v - y_mean);
        let weights = xc.map_axis(Axis(0), |col| col.dot(&col) / n);
        Self {
            x: xc,
            y: yc,
            x_means,
            y_mean,
            weights,
        }
    }
}

/// The smallest penalty at which every coefficient is zero.
pub fn max_penalty(x: &Array2<f64>, y: &Array1<f64>) -> f64 {
    let c = Centered::new(x, y.view());
    let n = x.nrows().max(1) as f64;
    c.x.t()
        .dot(&c.y)
        .iter()
        .fold(0.0_f64, |m, v| m.max(v.abs() / n))
}

fn fit_centered(
    c: &Centered,
    alpha: f64,
    options: &LassoOptions,
    warm_start: Option<&Array1<f64>>,
) -> LassoFit {
    let n = c.x.nrows().max(1) as f64;
    let p = c.x.ncols();
    let mut beta = match warm_start {
        Some(b) if b.len() == p => b.clone(),
        _ => Array1::zeros(p),
    };
    let mut residual = &c.y - &c.x.dot(&beta);

    let mut sweeps = 0;
    let mut converged = false;
    while sweeps < options.max_sweeps {
        sweeps += 1;
        let mut max_change = 0.0_f64;
        for j in 0..p {
            let w = c.weights[j];
            if w <= 0.0 {
                beta[j] = 0.0;
                continue;
            }
            let column = c.x.column(j);
            let old = beta[j];
            let z = column.dot(&residual) / n + w * old;
            let new = soft_threshold(z, alpha) / w;
            if new != old {
                residual.scaled_add(old - new, &column);
                beta[j] = new;
                max_change = max_change.max(w * (new - old).powi(2));
            }
        }
        if max_change < options.tolerance {
            converged = true;
            break;
        }
    }

    let intercept = c.y_mean - c.x_means.dot(&beta);
    LassoFit {
        alpha,
        intercept,
        coefficients: beta,
        sweeps,
        converged,
    }
}

/// Fits a single penalty.
pub fn fit_lasso(
    x: &Array2<f64>,
    y: &Array1<f64>,
    alpha: f64,
    options: &LassoOptions,
    warm_start: Option<&Array1<f64>>,
) -> LassoFit {
    let centered = Centered::new(x, y.view());
    let fit = fit_centered(&centered, alpha, options, warm_start);
    if !fit.converged {
        log::warn!(
            "Coordinate descent stopped after {} sweeps at alpha = {alpha:.3e} without converging",
            fit.sweeps
        );
    }
    fit
}

/// Fits every penalty of `alphas`, visiting them from largest to smallest
/// with warm starts. Penalties at or above [`max_penalty`] give the
/// intercept-only model without any sweeps. Fits are returned in the order of
/// `alphas`.
pub fn lasso_path(
    x: &Array2<f64>,
    y: &Array1<f64>,
    alphas: &[f64],
    options: &LassoOptions,
) -> Vec<LassoFit> {
    let centered = Centered::new(x, y.view());
    let alpha_max = max_penalty(x, y);
    let mut order: Vec<usize> = (0..alphas.len()).collect();
    order.sort_by(|&a, &b| alphas[b].total_cmp(&alphas[a]));

    let mut fits: Vec<Option<LassoFit>> = vec![None; alphas.len()];
    let mut previous: Option<Array1<f64>> = None;
    for i in order {
        let fit = if alphas[i] >= alpha_max {
            LassoFit {
                alpha: alphas[i],
                intercept: centered.y_mean,
                coefficients: Array1::zeros(x.ncols()),
                sweeps: 0,
                converged: true,
            }
        } else {
            fit_centered(&centered, alphas[i], options, previous.as_ref())
        };
        if !fit.converged {
            log::debug!("Path fit at alpha = {:.3e} hit the sweep limit", alphas[i]);
        }
        previous = Some(fit.coefficients.clone());
        fits[i] = Some(fit);
    }
    fits.into_iter().flatten().collect()
}
