//! Season output files.
//!
//! Every table is a tidy CSV with a header row; missing values are empty
//! fields. Files are written into the season output directory, which is
//! created on first use.

use crate::regress::model::{ModelError, TrainedModel};
use crate::table::PlotTable;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FEATURES: &str = "features.csv";
pub const HERITABILITY: &str = "heritability.csv";
pub const HERITABILITY_BY_TYPE: &str = "heritability_by_type.csv";
pub const HERITABILITY_OVER_TIME: &str = "heritability_over_time.csv";
pub const CV_CURVE: &str = "cv_curve.csv";
pub const COEFFICIENTS: &str = "coefficients.csv";
pub const TEST_PREDICTIONS: &str = "test_predictions.csv";
pub const PREDICTIONS: &str = "predictions.csv";
pub const REPLICATE_PAIRS: &str = "replicate_pairs.csv";
pub const REPLICATE_CONCORDANCE: &str = "replicate_concordance.csv";
pub const SPATIAL_MAP: &str = "spatial_map.csv";
pub const MODEL: &str = "model.toml";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write CSV '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("Failed to save the model bundle: {0}")]
    Model(#[from] ModelError),
}

/// Writes the tables of one season into a directory.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn create(dir: &Path) -> Result<Self, ReportError> {
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Serialises `rows` with their field names as the header.
    pub fn write_rows<T: Serialize>(&self, file_name: &str, rows: &[T]) -> Result<PathBuf, ReportError> {
        let path = self.path(file_name);
        let csv_error = |source| ReportError::Csv {
            path: path.display().to_string(),
            source,
        };
        let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        for row in rows {
            writer.serialize(row).map_err(csv_error)?;
        }
        writer.flush().map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Wrote {} rows to {}", rows.len(), path.display());
        Ok(path)
    }

    /// Writes a plot table as `plot_id` followed by its feature columns.
    pub fn write_table(&self, file_name: &str, table: &PlotTable) -> Result<PathBuf, ReportError> {
        let path = self.path(file_name);
        let csv_error = |source| ReportError::Csv {
            path: path.display().to_string(),
            source,
        };
        let file = File::create(&path).map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);

        let mut header = Vec::with_capacity(table.n_columns() + 1);
        header.push("plot_id");
        header.extend(table.names().iter().map(String::as_str));
        writer.write_record(&header).map_err(csv_error)?;

        let columns: Vec<&[f64]> = table.iter_columns().map(|(_, values)| values).collect();
        for (row, id) in table.plot_ids().iter().enumerate() {
            let mut record = Vec::with_capacity(columns.len() + 1);
            record.push(id.clone());
            record.extend(columns.iter().map(|values| {
                let v = values[row];
                if v.is_finite() { v.to_string() } else { String::new() }
            }));
            writer.write_record(&record).map_err(csv_error)?;
        }
        writer.flush().map_err(|source| ReportError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(path)
    }

    pub fn write_model(&self, model: &TrainedModel) -> Result<PathBuf, ReportError> {
        let path = self.path(MODEL);
        model.save(&path)?;
        Ok(path)
    }
}
