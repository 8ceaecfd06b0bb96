// mixed/reml.rs

//! # Variance Components by Restricted Maximum Likelihood
//!
//! Fits the linear mixed model
//!
//! ```text
//! y = 1·mu + Z_1 u_1 + ... + Z_K u_K + e,   u_k ~ N(0, s2_k I),   e ~ N(0, s2_e I)
//! ```
//!
//! where every random factor is a grouping of the observations (genotype,
//! replicate, ...). Only the intercept is fixed.
//!
//! The residual variance is profiled out, so the optimisation runs over the
//! log variance ratios `rho_k = ln(s2_k / s2_e)`. Each evaluation builds the
//! Henderson mixed-model equations
//!
//! ```text
//! C = [X'X, X'Z; Z'X, Z'Z + D^-1]   with   W = [X Z],  D = diag(gamma_k I)
//! ```
//!
//! and uses `-2 logL_R = (n-p) ln s2_e + ln|D| + ln|C| + const`, which only
//! needs matrices of size `1 + sum_k q_k` instead of `n x n`. The gradient is
//! analytic: `d(-logL_R)/d rho_k = (q_k - u_k'u_k / (s2_e gamma_k) - tr(C^kk) / gamma_k) / 2`.
//!
//! Optimisation is nested the usual way for variance components: a few
//! EM-REML sweeps move the ratios into the right basin, then BFGS with a
//! Wolfe line search polishes them. Ratios are confined to a box; on an active
//! bound the outward gradient component is projected away, so components that
//! collapse toward zero converge on the boundary instead of failing.
//!
//! Responses that are missing (`NaN`) are kept in the design but contribute
//! nothing to the likelihood; factor levels are formed from the observed rows.

use wolfe_bfgs::{Bfgs, BfgsSolution};

use itertools::Itertools;
use ndarray::{Array1, Array2, s};
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use thiserror::Error;

/// A comprehensive error type for mixed-model fitting.
#[derive(Error, Debug)]
pub enum MixedModelError {
    #[error("Only {found} observed responses; at least {required} are needed to fit the model.")]
    InsufficientObservations { found: usize, required: usize },

    #[error(
        "Random factor '{factor}' has {levels} level(s) among observed responses; at least 2 are required."
    )]
    TooFewLevels { factor: String, levels: usize },

    #[error("Random factor '{factor}' has {found} labels but the response has {expected} values.")]
    LengthMismatch {
        factor: String,
        found: usize,
        expected: usize,
    },

    #[error("The observed responses have zero variance.")]
    ConstantResponse,

    #[error("A linear system on the mixed-model equations failed: {0}")]
    LinearAlgebra(#[from] ndarray_linalg::error::LinalgError),

    #[error("REML optimization did not converge: {0}")]
    NotConverged(String),

    #[error("Unknown random factor '{0}'.")]
    UnknownFactor(String),
}

/// Optimiser settings for [`fit_reml`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemlOptions {
    /// EM-REML sweeps run before BFGS.
    pub em_iterations: usize,
    /// Maximum BFGS iterations.
    pub max_iterations: usize,
    /// Gradient-norm tolerance handed to BFGS.
    pub tolerance: f64,
    /// Largest projected gradient component, relative to the number of levels
    /// of its factor, accepted as a stationary point.
    pub acceptance_tolerance: f64,
    /// Box for the log variance ratios.
    pub log_ratio_bounds: (f64, f64),
}

impl Default for RemlOptions {
    fn default() -> Self {
        Self {
            em_iterations: 25,
            max_iterations: 200,
            tolerance: 1e-6,
            acceptance_tolerance: 1e-4,
            log_ratio_bounds: (-18.0, 12.0),
        }
    }
}

/// A random grouping factor: one level label per observation.
#[derive(Debug, Clone)]
pub struct RandomFactor {
    pub name: String,
    pub labels: Vec<String>,
}

impl RandomFactor {
    pub fn new(name: impl Into<String>, labels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

/// Estimated variance of one random factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponent {
    pub factor: String,
    pub variance: f64,
}

/// Predicted factor-level means and the standard errors of their differences.
#[derive(Debug, Clone)]
pub struct LevelPredictions {
    pub levels: Vec<String>,
    /// `mu + u_i` for each level.
    pub means: Array1<f64>,
    /// Symmetric matrix of standard errors of pairwise differences.
    pub sed: Array2<f64>,
    /// Mean of the upper-triangle entries of `sed`.
    pub mean_sed: f64,
}

#[derive(Debug, Clone)]
struct FittedFactor {
    name: String,
    levels: Vec<String>,
    blups: Array1<f64>,
    /// Prediction-error covariance of `blups`.
    pev: Array2<f64>,
}

/// A converged REML fit on the original response scale.
#[derive(Debug, Clone)]
pub struct MixedModelFit {
    pub intercept: f64,
    pub components: Vec<VarianceComponent>,
    pub residual_variance: f64,
    /// Restricted log-likelihood, up to an additive constant.
    pub log_likelihood: f64,
    pub n_observations: usize,
    /// EM sweeps plus BFGS iterations.
    pub iterations: usize,
    factors: Vec<FittedFactor>,
}

impl MixedModelFit {
    pub fn variance(&self, factor: &str) -> Option<f64> {
        self.components
            .iter()
            .find(|c| c.factor == factor)
            .map(|c| c.variance)
    }

    /// BLUPs of a factor's levels, in level order.
    pub fn blups(&self, factor: &str) -> Option<(&[String], &Array1<f64>)> {
        self.factors
            .iter()
            .find(|f| f.name == factor)
            .map(|f| (f.levels.as_slice(), &f.blups))
    }

    pub fn prediction_error_covariance(&self, factor: &str) -> Option<&Array2<f64>> {
        self.factors.iter().find(|f| f.name == factor).map(|f| &f.pev)
    }

    /// Predicted means of a factor's levels with the other random factors
    /// averaged out (set to zero), plus standard errors of all pairwise
    /// differences. The intercept's estimation error cancels in differences.
    pub fn predict_level_means(&self, factor: &str) -> Result<LevelPredictions, MixedModelError> {
        let fitted = self
            .factors
            .iter()
            .find(|f| f.name == factor)
            .ok_or_else(|| MixedModelError::UnknownFactor(factor.to_string()))?;

        let m = fitted.levels.len();
        let means = fitted.blups.mapv(|u| self.intercept + u);

        let mut sed = Array2::zeros((m, m));
        let mut total = 0.0;
        let mut pairs = 0usize;
        for (i, j) in (0..m).tuple_combinations() {
            let var = fitted.pev[[i, i]] + fitted.pev[[j, j]] - 2.0 * fitted.pev[[i, j]];
            let se = var.max(0.0).sqrt();
            sed[[i, j]] = se;
            sed[[j, i]] = se;
            total += se;
            pairs += 1;
        }
        let mean_sed = if pairs > 0 { total / pairs as f64 } else { f64::NAN };

        Ok(LevelPredictions {
            levels: fitted.levels.clone(),
            means,
            sed,
            mean_sed,
        })
    }
}

/// Fits the model by REML. `y` may contain `NaN` for unobserved plots.
pub fn fit_reml(
    y: &[f64],
    factors: &[RandomFactor],
    options: &RemlOptions,
) -> Result<MixedModelFit, MixedModelError> {
    // 1. Reduce to observed rows and index the factor levels.
    let design = internal::Design::build(y, factors)?;

    // 2. EM-REML warm start from equal variance shares.
    let (lo, hi) = options.log_ratio_bounds;
    let mut rho = Array1::from_elem(design.factors.len(), 0.0);
    let mut iterations = 0usize;
    for _ in 0..options.em_iterations {
        let eval = design.evaluate(&rho)?;
        let next = design.em_step(&rho, &eval).mapv(|v| v.clamp(lo, hi));
        let shift = (&next - &rho).mapv(f64::abs).fold(0.0_f64, |a, &b| a.max(b));
        rho = next;
        iterations += 1;
        if shift < 1e-8 {
            break;
        }
    }

    // 3. BFGS polish unless the warm start is already stationary.
    let warm = design.evaluate(&rho)?;
    if !design.is_stationary(&rho, &warm, options.log_ratio_bounds, options.tolerance) {
        rho = internal::polish_with_bfgs(&design, rho, options, &mut iterations)?;
    }

    // 4. Assemble the fit on the original scale.
    let final_eval = design.evaluate(&rho)?;
    let fit = design.into_fit(&rho, &final_eval, iterations);
    log::debug!(
        "REML converged after {} iterations: components {:?}, residual {:.4e}",
        fit.iterations,
        fit.components,
        fit.residual_variance
    );
    Ok(fit)
}

/// Internal module for the mixed-model equations and their optimisation.
mod internal {
    use super::*;

    pub(super) struct Factor {
        pub(super) name: String,
        pub(super) levels: Vec<String>,
        /// Level of each observed row.
        pub(super) assignment: Vec<usize>,
        /// First column of this factor in `W`.
        pub(super) offset: usize,
    }

    /// Sufficient statistics of the standardised, observed response.
    pub(super) struct Design {
        pub(super) factors: Vec<Factor>,
        n: usize,
        dim: usize,
        wtw: Array2<f64>,
        wty: Array1<f64>,
        yty: f64,
        y_mean: f64,
        y_scale: f64,
    }

    /// Everything one REML evaluation produces.
    pub(super) struct Evaluation {
        pub(super) cost: f64,
        pub(super) gradient: Array1<f64>,
        sigma2: f64,
        solution: Array1<f64>,
        c_inv: Array2<f64>,
    }

    impl Design {
        pub(super) fn build(y: &[f64], factors: &[RandomFactor]) -> Result<Self, MixedModelError> {
            for factor in factors {
                if factor.labels.len() != y.len() {
                    return Err(MixedModelError::LengthMismatch {
                        factor: factor.name.clone(),
                        found: factor.labels.len(),
                        expected: y.len(),
                    });
                }
            }

            let observed: Vec<usize> = (0..y.len()).filter(|&i| y[i].is_finite()).collect();
            let n = observed.len();
            let required = factors.len() + 3;
            if n < required {
                return Err(MixedModelError::InsufficientObservations { found: n, required });
            }

            let values: Vec<f64> = observed.iter().map(|&i| y[i]).collect();
            let y_mean = values.iter().sum::<f64>() / n as f64;
            let var = values.iter().map(|v| (v - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            if !(var > 0.0) || !var.is_finite() {
                return Err(MixedModelError::ConstantResponse);
            }
            let y_scale = var.sqrt();
            let ys: Array1<f64> = values.iter().map(|v| (v - y_mean) / y_scale).collect();

            // Column 0 of W is the intercept; factor levels follow in blocks.
            let mut built = Vec::with_capacity(factors.len());
            let mut offset = 1;
            for factor in factors {
                let mut level_index: HashMap<&str, usize> = HashMap::new();
                let mut levels = Vec::new();
                let mut assignment = Vec::with_capacity(n);
                for &i in &observed {
                    let label = factor.labels[i].as_str();
                    let next = levels.len();
                    let idx = *level_index.entry(label).or_insert_with(|| {
                        levels.push(label.to_string());
                        next
                    });
                    assignment.push(idx);
                }
                if levels.len() < 2 {
                    return Err(MixedModelError::TooFewLevels {
                        factor: factor.name.clone(),
                        levels: levels.len(),
                    });
                }
                let q = levels.len();
                built.push(Factor {
                    name: factor.name.clone(),
                    levels,
                    assignment,
                    offset,
                });
                offset += q;
            }
            let dim = offset;

            let mut wtw = Array2::<f64>::zeros((dim, dim));
            let mut wty = Array1::<f64>::zeros(dim);
            let mut columns = Vec::with_capacity(built.len() + 1);
            for (row, &yv) in ys.iter().enumerate() {
                columns.clear();
                columns.push(0);
                columns.extend(built.iter().map(|f| f.offset + f.assignment[row]));
                for &a in &columns {
                    wty[a] += yv;
                    for &b in &columns {
                        wtw[[a, b]] += 1.0;
                    }
                }
            }
            let yty = ys.dot(&ys);

            Ok(Self {
                factors: built,
                n,
                dim,
                wtw,
                wty,
                yty,
                y_mean,
                y_scale,
            })
        }

        fn dof(&self) -> f64 {
            (self.n - 1) as f64
        }

        pub(super) fn evaluate(&self, rho: &Array1<f64>) -> Result<Evaluation, MixedModelError> {
            let gamma = rho.mapv(f64::exp);

            let mut c = self.wtw.clone();
            for (k, factor) in self.factors.iter().enumerate() {
                for j in factor.offset..factor.offset + factor.levels.len() {
                    c[[j, j]] += 1.0 / gamma[k];
                }
            }

            let lower = c.cholesky(UPLO::Lower)?;
            let log_det_c = 2.0 * lower.diag().mapv(f64::ln).sum();
            let c_inv = c.inv()?;
            let solution = c_inv.dot(&self.wty);

            // Penalised residual sum of squares at the solution.
            let ypy = (self.yty - solution.dot(&self.wty)).max(f64::MIN_POSITIVE);
            let sigma2 = ypy / self.dof();

            let log_det_d: f64 = self
                .factors
                .iter()
                .zip(rho.iter())
                .map(|(f, &r)| f.levels.len() as f64 * r)
                .sum();

            let cost = 0.5 * (self.dof() * sigma2.ln() + log_det_d + log_det_c);

            let gradient = self
                .factors
                .iter()
                .enumerate()
                .map(|(k, f)| {
                    let block = f.offset..f.offset + f.levels.len();
                    let u = solution.slice(s![block.clone()]);
                    let trace: f64 = block.map(|j| c_inv[[j, j]]).sum();
                    0.5 * (f.levels.len() as f64
                        - u.dot(&u) / (sigma2 * gamma[k])
                        - trace / gamma[k])
                })
                .collect();

            Ok(Evaluation {
                cost,
                gradient,
                sigma2,
                solution,
                c_inv,
            })
        }

        /// One EM-REML update of the log variance ratios.
        pub(super) fn em_step(&self, rho: &Array1<f64>, eval: &Evaluation) -> Array1<f64> {
            self.factors
                .iter()
                .enumerate()
                .map(|(k, f)| {
                    let block = f.offset..f.offset + f.levels.len();
                    let u = eval.solution.slice(s![block.clone()]);
                    let trace: f64 = block.map(|j| eval.c_inv[[j, j]]).sum();
                    let component = (u.dot(&u) + eval.sigma2 * trace) / f.levels.len() as f64;
                    let ratio = component / eval.sigma2;
                    if ratio.is_finite() && ratio > 0.0 {
                        ratio.ln()
                    } else {
                        rho[k]
                    }
                })
                .collect()
        }

        /// Gradient with outward components on active bounds removed.
        pub(super) fn projected_gradient(
            &self,
            rho: &Array1<f64>,
            gradient: &Array1<f64>,
            bounds: (f64, f64),
        ) -> Array1<f64> {
            let (lo, hi) = bounds;
            let mut projected = gradient.clone();
            for k in 0..projected.len() {
                let at_lower = rho[k] <= lo && projected[k] > 0.0;
                let at_upper = rho[k] >= hi && projected[k] < 0.0;
                if at_lower || at_upper {
                    projected[k] = 0.0;
                }
            }
            projected
        }

        /// True when every projected gradient component, per level of its
        /// factor, is within `tolerance`.
        pub(super) fn is_stationary(
            &self,
            rho: &Array1<f64>,
            eval: &Evaluation,
            bounds: (f64, f64),
            tolerance: f64,
        ) -> bool {
            let projected = self.projected_gradient(rho, &eval.gradient, bounds);
            self.factors
                .iter()
                .zip(projected.iter())
                .all(|(f, g)| g.abs() / f.levels.len() as f64 <= tolerance)
        }

        pub(super) fn into_fit(
            self,
            rho: &Array1<f64>,
            eval: &Evaluation,
            iterations: usize,
        ) -> MixedModelFit {
            let scale2 = self.y_scale * self.y_scale;
            let residual_variance = eval.sigma2 * scale2;

            let components = self
                .factors
                .iter()
                .zip(rho.iter())
                .map(|(f, &r)| VarianceComponent {
                    factor: f.name.clone(),
                    variance: r.exp() * residual_variance,
                })
                .collect();

            let factors = self
                .factors
                .into_iter()
                .map(|f| {
                    let block = f.offset..f.offset + f.levels.len();
                    let blups = eval.solution.slice(s![block.clone()]).mapv(|u| u * self.y_scale);
                    let pev = eval
                        .c_inv
                        .slice(s![block.clone(), block])
                        .mapv(|v| v * residual_variance);
                    FittedFactor {
                        name: f.name,
                        levels: f.levels,
                        blups,
                        pev,
                    }
                })
                .collect();

            let dof = (self.n - 1) as f64;
            let log_likelihood = -eval.cost
                - 0.5 * dof * (1.0 + (2.0 * std::f64::consts::PI).ln())
                - dof * self.y_scale.ln();

            MixedModelFit {
                intercept: self.y_mean + eval.solution[0] * self.y_scale,
                components,
                residual_variance,
                log_likelihood,
                n_observations: self.n,
                iterations,
                factors,
            }
        }
    }

    /// Runs BFGS from `start`; falls back to the best evaluated point when the
    /// line search stalls on a point that is already stationary.
    pub(super) fn polish_with_bfgs(
        design: &Design,
        start: Array1<f64>,
        options: &RemlOptions,
        iterations: &mut usize,
    ) -> Result<Array1<f64>, MixedModelError> {
        let (lo, hi) = options.log_ratio_bounds;
        let best: RefCell<Option<(f64, Array1<f64>)>> = RefCell::new(None);

        let cost_and_grad = |rho_bfgs: &Array1<f64>| -> (f64, Array1<f64>) {
            let rho = rho_bfgs.mapv(|v| v.clamp(lo, hi));
            match design.evaluate(&rho) {
                Ok(eval) if eval.cost.is_finite() => {
                    let grad = design.projected_gradient(rho_bfgs, &eval.gradient, (lo, hi));
                    let mut slot = best.borrow_mut();
                    if slot.as_ref().is_none_or(|(c, _)| eval.cost < *c) {
                        *slot = Some((eval.cost, rho.clone()));
                    }
                    (eval.cost, grad)
                }
                Ok(eval) => {
                    log::warn!("Non-finite REML cost {} at rho {:?}", eval.cost, rho.to_vec());
                    (1e10, Array1::zeros(rho.len()))
                }
                Err(e) => {
                    log::warn!("REML evaluation failed at rho {:?}: {}", rho.to_vec(), e);
                    (1e10, Array1::zeros(rho.len()))
                }
            }
        };

        let outcome = Bfgs::new(start, cost_and_grad)
            .with_tolerance(options.tolerance)
            .with_max_iterations(options.max_iterations)
            .run();

        match outcome {
            Ok(BfgsSolution {
                final_point,
                iterations: bfgs_iterations,
                ..
            }) => {
                *iterations += bfgs_iterations;
                Ok(final_point.mapv(|v| v.clamp(lo, hi)))
            }
            Err(e) => {
                let fallback = best.borrow().as_ref().map(|(_, rho)| rho.clone());
                if let Some(rho) = fallback {
                    let eval = design.evaluate(&rho)?;
                    if design.is_stationary(
                        &rho,
                        &eval,
                        options.log_ratio_bounds,
                        options.acceptance_tolerance,
                    ) {
                        log::debug!("BFGS stopped early ({e:?}) at a stationary point; accepting it");
                        return Ok(rho);
                    }
                }
                Err(MixedModelError::NotConverged(format!("BFGS failed: {e:?}")))
            }
        }
    }
}
