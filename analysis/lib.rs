//! Flowering-time phenotyping from drone imagery.
//!
//! The crate turns a season's per-plot drone summary into plant-height
//! features, screens their heritability with a genotype + replicate mixed
//! model, and imputes anthesis GDD for unscored plots with a cross-validated
//! LASSO. [`season::run_season`] runs the whole pipeline from a
//! [`config::SeasonConfig`].

pub mod config;
pub mod diagnostics;
pub mod features;
pub mod inference;
pub mod report;
pub mod season;
pub mod stats;
pub mod table;

#[path = "../mixed/mod.rs"]
pub mod mixed;
#[path = "../regress/mod.rs"]
pub mod regress;
