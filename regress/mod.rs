//! Flowering-time regression: stratified splitting, the preprocessing recipe,
//! LASSO by coordinate descent, penalty tuning by cross-validation and the
//! persisted model bundle.

pub mod lasso;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod split;
pub mod train;
pub mod tuning;

use crate::table::DataError;
use thiserror::Error;

/// Failures of splitting, preprocessing, fitting or tuning.
#[derive(Error, Debug)]
pub enum RegressionError {
    #[error("Only {found} labelled plots are available; at least {required} are needed.")]
    TooFewObservations { found: usize, required: usize },

    #[error("Invalid regression setting: {0}")]
    InvalidSetting(String),

    #[error("No features remain after removing near-zero-variance columns.")]
    NoUsableFeatures,

    #[error("The design matrix has {found} columns but the recipe expects {expected}.")]
    ShapeMismatch { found: usize, expected: usize },

    #[error(
        "Cross-validation produced no defined R² for any penalty; every fold predicted a constant."
    )]
    NoDefinedPenalty,

    #[error(transparent)]
    Table(#[from] DataError),
}
