//! # Feature Engineering
//!
//! Turns the raw per-plot drone summary into the cleaned feature table used by
//! both the heritability screen and the flowering-time regression.
//!
//! Canopy elevation quantiles are absolute heights above the survey datum, so
//! on their own they mostly encode field topography. Subtracting a reference
//! soil-surface quantile from the same plot turns them into plant-height
//! proxies. The soil columns are only an input to that subtraction and never
//! reach the output table.
//!
//! Scaling and imputation are deliberately absent here; they belong to the
//! regression recipe, which fits them on training plots only.

use crate::table::{DataError, PlotTable};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Column naming rules for one season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSpec {
    /// Identifier or index columns that are not features (e.g. an exported row index).
    pub drop_columns: Vec<String>,
    /// Substring identifying canopy-elevation quantile columns.
    pub canopy_marker: String,
    /// Substring identifying raw soil-elevation columns.
    pub soil_marker: String,
    /// Full name of the soil-elevation column subtracted from every canopy column.
    /// It embeds the acquisition date, so it differs between seasons.
    pub reference_soil_column: String,
    /// Replaces `canopy_marker` in the names of derived height columns.
    pub height_marker: String,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            drop_columns: vec!["index".to_string()],
            canopy_marker: "elev_veg".to_string(),
            soil_marker: "elev_soil".to_string(),
            reference_soil_column: String::new(),
            height_marker: "height".to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error(
        "Reference soil column '{column}' was not found. Soil columns present: [{available}]. The reference name embeds a season-specific date; check the season configuration."
    )]
    ReferenceColumnMissing { column: String, available: String },
    #[error("Derived height column '{0}' collides with an existing column.")]
    DerivedNameCollision(String),
    #[error("Canopy marker '{canopy}' and soil marker '{soil}' must be non-empty and distinct.")]
    InvalidMarkers { canopy: String, soil: String },
    #[error(transparent)]
    Table(#[from] DataError),
}

/// What `engineer_features` did to the table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineeringReport {
    pub dropped_identifiers: Vec<String>,
    pub non_finite_replaced: usize,
    pub derived_heights: Vec<String>,
    pub dropped_soil: Vec<String>,
    pub dropped_constant: Vec<String>,
}

/// Produces the cleaned feature table from a raw per-plot table.
///
/// Steps, in order: drop identifier columns, replace infinite values with
/// missing, subtract the reference soil column from every canopy-elevation
/// column, drop all soil columns, drop constant columns. The function is pure:
/// the same input always yields the same table.
pub fn engineer_features(
    raw: &PlotTable,
    spec: &FeatureSpec,
) -> Result<(PlotTable, EngineeringReport), FeatureError> {
    if spec.canopy_marker.is_empty()
        || spec.soil_marker.is_empty()
        || spec.canopy_marker == spec.soil_marker
    {
        return Err(FeatureError::InvalidMarkers {
            canopy: spec.canopy_marker.clone(),
            soil: spec.soil_marker.clone(),
        });
    }

    let mut report = EngineeringReport::default();
    let (plot_ids, names, columns) = raw.clone().into_parts();

    // --- 1. Identifier columns ---
    let mut kept: Vec<(String, Vec<f64>)> = Vec::with_capacity(names.len());
    for (name, values) in names.into_iter().zip(columns) {
        if spec.drop_columns.iter().any(|d| d == &name) {
            report.dropped_identifiers.push(name);
        } else {
            kept.push((name, values));
        }
    }

    // --- 2. Division-by-zero artifacts become missing ---
    for (_, values) in kept.iter_mut() {
        for v in values.iter_mut() {
            if v.is_infinite() {
                *v = f64::NAN;
                report.non_finite_replaced += 1;
            }
        }
    }

    // --- 3. Reference soil elevation ---
    let reference = kept
        .iter()
        .find(|(name, _)| name == &spec.reference_soil_column)
        .map(|(_, values)| values.clone())
        .ok_or_else(|| FeatureError::ReferenceColumnMissing {
            column: spec.reference_soil_column.clone(),
            available: kept
                .iter()
                .filter(|(name, _)| name.contains(&spec.soil_marker))
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        })?;

    // --- 4 & 5. Plant heights replace canopy elevations; soil columns go ---
    let mut out_names = Vec::with_capacity(kept.len());
    let mut out_columns = Vec::with_capacity(kept.len());
    for (name, values) in kept {
        if name == spec.reference_soil_column || name.contains(&spec.soil_marker) {
            report.dropped_soil.push(name);
            continue;
        }
        if name.contains(&spec.canopy_marker) {
            let derived = name.replace(&spec.canopy_marker, &spec.height_marker);
            let heights: Vec<f64> = values
                .iter()
                .zip(&reference)
                .map(|(canopy, soil)| canopy - soil)
                .collect();
            report.derived_heights.push(derived.clone());
            out_names.push(derived);
            out_columns.push(heights);
        } else {
            out_names.push(name);
            out_columns.push(values);
        }
    }

    let mut seen = HashSet::with_capacity(out_names.len());
    for name in &out_names {
        if !seen.insert(name.as_str()) {
            return Err(FeatureError::DerivedNameCollision(name.clone()));
        }
    }

    // --- 6. Constant columns carry no information ---
    let mut final_names = Vec::with_capacity(out_names.len());
    let mut final_columns = Vec::with_capacity(out_columns.len());
    for (name, values) in out_names.into_iter().zip(out_columns) {
        if distinct_finite_values(&values) <= 1 {
            report.dropped_constant.push(name);
        } else {
            final_names.push(name);
            final_columns.push(values);
        }
    }

    log::info!(
        "Feature engineering: {} columns kept, {} heights derived, {} soil and {} constant columns dropped, {} infinite values set missing",
        final_names.len(),
        report.derived_heights.len(),
        report.dropped_soil.len(),
        report.dropped_constant.len(),
        report.non_finite_replaced
    );

    let table = PlotTable::new(plot_ids, final_names, final_columns)?;
    Ok((table, report))
}

fn distinct_finite_values(values: &[f64]) -> usize {
    values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.to_bits())
        .collect::<HashSet<u64>>()
        .len()
}

/// A feature name split into its feature type and acquisition date.
///
/// Names are `_`-separated tokens, one of which is the flight date
/// (`YYYYMMDD` or `YYYY-MM-DD`), e.g. `NDVI_q50_20210715`. The feature type is
/// the name with the date token removed (`NDVI_q50`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureName {
    pub name: String,
    pub feature_type: String,
    pub acquisition_date: Option<NaiveDate>,
}

impl FeatureName {
    pub fn parse(name: &str) -> Self {
        let tokens: Vec<&str> = name.split('_').collect();
        let dated = tokens
            .iter()
            .enumerate()
            .find_map(|(i, token)| parse_date_token(token).map(|date| (i, date)));

        match dated {
            Some((position, date)) => {
                let feature_type = tokens
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != position)
                    .map(|(_, t)| *t)
                    .collect::<Vec<_>>()
                    .join("_");
                Self {
                    name: name.to_string(),
                    feature_type,
                    acquisition_date: Some(date),
                }
            }
            None => Self {
                name: name.to_string(),
                feature_type: name.to_string(),
                acquisition_date: None,
            },
        }
    }
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    if token.len() == 8 && token.chars().all(|c| c.is_ascii_digit()) {
        return NaiveDate::parse_from_str(token, "%Y%m%d").ok();
    }
    if token.len() == 10 {
        return NaiveDate::parse_from_str(token, "%Y-%m-%d").ok();
    }
    None
}
