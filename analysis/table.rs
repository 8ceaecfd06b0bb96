//! # Plot Tables and Trial Design
//!
//! This module is the exclusive entry point for season input files. Two tables
//! arrive per season: the drone-feature summary (one row per plot, one numeric
//! column per image statistic) and the trial design (experiment, pedigree,
//! replicate, field position and, for a subset of plots, the observed anthesis
//! GDD). Both are keyed by plot ID, which must be unique within each table.
//!
//! - Missing values are carried as `NaN` inside [`PlotTable`], so downstream
//!   numerics work on plain `f64` buffers.
//! - Failures are assumed to be user-input errors and [`DataError`] names the
//!   offending file, column or plot.
//! - Reading is done with the `polars` CSV reader; the separator follows the
//!   file extension (`.tsv`/`.txt` tab, anything else comma). `NA` and blank
//!   cells are nulls. Columns the reader infers as text are still numeric when
//!   every cell parses as a float, which covers `Inf`/`-Inf` written by R.

use ndarray::Array2;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for all table loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error while reading '{path}': {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be read as {expected_type}. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Plot ID '{0}' appears more than once; plot IDs must be unique within a table.")]
    DuplicatePlotId(String),
    #[error("Column '{0}' appears more than once in the table.")]
    DuplicateColumn(String),
    #[error("Column '{name}' has {found} values but the table has {expected} plots.")]
    RaggedColumn {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("A plot ID is missing at data row {0}.")]
    MissingPlotId(usize),
}

/// Per-plot numeric feature table. Column order is preserved from the input.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotTable {
    plot_ids: Vec<String>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl PlotTable {
    /// Builds a table, enforcing unique plot IDs, unique column names and
    /// one value per plot in every column.
    pub fn new(
        plot_ids: Vec<String>,
        names: Vec<String>,
        columns: Vec<Vec<f64>>,
    ) -> Result<Self, DataError> {
        let mut seen = HashSet::with_capacity(plot_ids.len());
        for id in &plot_ids {
            if !seen.insert(id.as_str()) {
                return Err(DataError::DuplicatePlotId(id.clone()));
            }
        }

        let mut seen_names = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen_names.insert(name.as_str()) {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }

        if names.len() != columns.len() {
            return Err(DataError::RaggedColumn {
                name: "<column names>".to_string(),
                found: names.len(),
                expected: columns.len(),
            });
        }
        for (name, values) in names.iter().zip(&columns) {
            if values.len() != plot_ids.len() {
                return Err(DataError::RaggedColumn {
                    name: name.clone(),
                    found: values.len(),
                    expected: plot_ids.len(),
                });
            }
        }

        Ok(Self {
            plot_ids,
            names,
            columns,
        })
    }

    pub fn n_plots(&self) -> usize {
        self.plot_ids.len()
    }

    pub fn n_columns(&self) -> usize {
        self.names.len()
    }

    pub fn plot_ids(&self) -> &[String] {
        &self.plot_ids
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.column_index(name).map(|i| self.columns[i].as_slice())
    }

    /// Iterates `(name, values)` pairs in column order.
    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &[f64])> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.columns.iter().map(Vec::as_slice))
    }

    pub fn row_of(&self, plot_id: &str) -> Option<usize> {
        self.plot_ids.iter().position(|id| id == plot_id)
    }

    /// Keeps only the rows at `indices`, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> PlotTable {
        PlotTable {
            plot_ids: indices.iter().map(|&i| self.plot_ids[i].clone()).collect(),
            names: self.names.clone(),
            columns: self
                .columns
                .iter()
                .map(|col| indices.iter().map(|&i| col[i]).collect())
                .collect(),
        }
    }

    /// Keeps the plots whose ID satisfies `keep`.
    pub fn retain_plots<F: Fn(&str) -> bool>(&self, keep: F) -> PlotTable {
        let indices: Vec<usize> = self
            .plot_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| keep(id))
            .map(|(i, _)| i)
            .collect();
        self.select_rows(&indices)
    }

    /// Keeps only the named columns, in the given order.
    pub fn select_columns(&self, names: &[String]) -> Result<PlotTable, DataError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let values = self
                .column(name)
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))?;
            columns.push(values.to_vec());
        }
        PlotTable::new(self.plot_ids.clone(), names.to_vec(), columns)
    }

    /// Dense `[n_plots, names.len()]` matrix of the requested columns.
    pub fn matrix(&self, names: &[String]) -> Result<Array2<f64>, DataError> {
        let mut out = Array2::from_elem((self.n_plots(), names.len()), f64::NAN);
        for (j, name) in names.iter().enumerate() {
            let values = self
                .column(name)
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))?;
            for (i, &v) in values.iter().enumerate() {
                out[[i, j]] = v;
            }
        }
        Ok(out)
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<String>, Vec<Vec<f64>>) {
        (self.plot_ids, self.names, self.columns)
    }
}

/// Column names of the trial design table. Seasons name these differently,
/// so they come from the season configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignColumns {
    pub plot_id: String,
    pub experiment: Option<String>,
    pub pedigree: String,
    pub replicate: String,
    pub row: Option<String>,
    pub column: Option<String>,
    pub flowering: String,
}

impl Default for DesignColumns {
    fn default() -> Self {
        Self {
            plot_id: "plot_id".to_string(),
            experiment: Some("experiment".to_string()),
            pedigree: "pedigree".to_string(),
            replicate: "rep".to_string(),
            row: Some("row".to_string()),
            column: Some("range".to_string()),
            flowering: "anthesis_gdd".to_string(),
        }
    }
}

/// One plot of the field trial.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignRecord {
    pub plot_id: String,
    pub experiment: Option<String>,
    pub pedigree: String,
    pub replicate: String,
    pub row: Option<i64>,
    pub column: Option<i64>,
    /// Observed anthesis in growing-degree-days; `None` when not scored.
    pub flowering_gdd: Option<f64>,
}

/// The trial design of one season, indexed by plot ID.
#[derive(Debug, Clone)]
pub struct DesignTable {
    records: Vec<DesignRecord>,
    index: HashMap<String, usize>,
}

impl DesignTable {
    pub fn new(records: Vec<DesignRecord>) -> Result<Self, DataError> {
        let mut index = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if index.insert(record.plot_id.clone(), i).is_some() {
                return Err(DataError::DuplicatePlotId(record.plot_id.clone()));
            }
        }
        Ok(Self { records, index })
    }

    pub fn records(&self) -> &[DesignRecord] {
        &self.records
    }

    pub fn get(&self, plot_id: &str) -> Option<&DesignRecord> {
        self.index.get(plot_id).map(|&i| &self.records[i])
    }

    /// Observed flowering times keyed by plot ID. Plots without a score are absent.
    pub fn labels(&self) -> HashMap<String, f64> {
        self.records
            .iter()
            .filter_map(|r| {
                r.flowering_gdd
                    .filter(|v| v.is_finite())
                    .map(|v| (r.plot_id.clone(), v))
            })
            .collect()
    }

    /// Plot IDs belonging to any of `experiments`.
    pub fn plots_in_experiments(&self, experiments: &[String]) -> HashSet<String> {
        self.records
            .iter()
            .filter(|r| {
                r.experiment
                    .as_ref()
                    .is_some_and(|e| experiments.iter().any(|x| x == e))
            })
            .map(|r| r.plot_id.clone())
            .collect()
    }
}

/// Loads the per-plot drone-feature summary. Every numeric column besides the
/// plot ID becomes a feature column; text columns are skipped with a warning.
pub fn load_feature_table(path: &Path, id_column: &str) -> Result<PlotTable, DataError> {
    log::info!("Loading feature table from '{}'", path.display());
    let df = internal::read_tabular(path)?;

    let plot_ids = internal::required_ids(&df, id_column)?;

    let mut names = Vec::new();
    let mut columns = Vec::new();
    for name in df.get_column_names().iter().map(|n| n.to_string()) {
        if name == id_column {
            continue;
        }
        match internal::numeric_values(&df, &name)? {
            Some(values) => {
                names.push(name);
                columns.push(values);
            }
            None => log::warn!("Skipping non-numeric column '{name}' in feature table"),
        }
    }

    let table = PlotTable::new(plot_ids, names, columns)?;
    log::info!(
        "Loaded {} plots with {} numeric columns",
        table.n_plots(),
        table.n_columns()
    );
    Ok(table)
}

/// Loads the trial design table using the season's column names.
pub fn load_design_table(path: &Path, columns: &DesignColumns) -> Result<DesignTable, DataError> {
    log::info!("Loading trial design from '{}'", path.display());
    let df = internal::read_tabular(path)?;

    let plot_ids = internal::required_ids(&df, &columns.plot_id)?;
    let n = plot_ids.len();

    let pedigree = internal::string_values(&df, &columns.pedigree)?;
    let replicate = internal::string_values(&df, &columns.replicate)?;
    let experiment = match &columns.experiment {
        Some(name) => internal::string_values(&df, name)?,
        None => vec![None; n],
    };
    let row = match &columns.row {
        Some(name) => internal::optional_f64(&df, name)?,
        None => vec![None; n],
    };
    let column = match &columns.column {
        Some(name) => internal::optional_f64(&df, name)?,
        None => vec![None; n],
    };
    let flowering = internal::optional_f64(&df, &columns.flowering)?;

    let records = (0..n)
        .map(|i| DesignRecord {
            plot_id: plot_ids[i].clone(),
            experiment: experiment[i].clone(),
            pedigree: pedigree[i].clone().unwrap_or_default(),
            replicate: replicate[i].clone().unwrap_or_default(),
            row: row[i].map(|v| v.round() as i64),
            column: column[i].map(|v| v.round() as i64),
            flowering_gdd: flowering[i],
        })
        .collect();

    let design = DesignTable::new(records)?;
    log::info!(
        "Loaded {} design records ({} with observed flowering time)",
        design.records().len(),
        design.labels().len()
    );
    Ok(design)
}

/// Internal module for shared polars plumbing.
mod internal {
    use super::*;

    /// Cell contents read as null in every column.
    const NULL_TOKENS: [&str; 2] = ["NA", ""];

    pub(super) fn read_tabular(path: &Path) -> Result<DataFrame, DataError> {
        let separator = match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("tsv") | Some("txt") | Some("tab") => b'\t',
            _ => b',',
        };

        let file = File::open(path).map_err(|source| DataError::IoError {
            path: path.display().to_string(),
            source,
        })?;
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(None)
            .map_parse_options(|options| {
                options.with_separator(separator).with_null_values(Some(
                    NullValues::AllColumns(NULL_TOKENS.iter().map(|t| (*t).into()).collect()),
                ))
            })
            .into_reader_with_file_handle(file)
            .finish()?;
        Ok(df)
    }

    fn is_numeric(dtype: &DataType) -> bool {
        matches!(
            dtype,
            DataType::Float64
                | DataType::Float32
                | DataType::Int64
                | DataType::Int32
                | DataType::UInt64
                | DataType::UInt32
        )
    }

    /// Numeric column as `f64` with nulls turned into `NaN`; `None` when some
    /// cell is not a number.
    pub(super) fn numeric_values(
        df: &DataFrame,
        name: &str,
    ) -> Result<Option<Vec<f64>>, DataError> {
        let column = df
            .column(name)
            .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
        if is_numeric(column.dtype()) {
            let casted = column.cast(&DataType::Float64)?;
            let values = casted.f64()?;
            return Ok(Some(
                values
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect(),
            ));
        }

        // The reader only infers lowercase `inf` as a float token.
        let casted = column.cast(&DataType::String)?;
        let mut parsed = Vec::with_capacity(casted.len());
        for cell in casted.str()?.into_iter() {
            let value = match cell.map(str::trim) {
                None | Some("") => f64::NAN,
                Some(text) => match text.parse::<f64>() {
                    Ok(v) => v,
                    Err(_) => return Ok(None),
                },
            };
            parsed.push(value);
        }
        Ok(Some(parsed))
    }

    /// Numeric column where missing cells are allowed. Non-finite values are
    /// missing too.
    pub(super) fn optional_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let column = df
            .column(name)
            .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
        match numeric_values(df, name)? {
            Some(values) => Ok(values
                .into_iter()
                .map(|v| if v.is_finite() { Some(v) } else { None })
                .collect()),
            None => Err(DataError::ColumnWrongType {
                column_name: name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            }),
        }
    }

    pub(super) fn string_values(
        df: &DataFrame,
        name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let column = df
            .column(name)
            .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
        let casted = column.cast(&DataType::String)?;
        let values = casted.str()?;
        Ok(values
            .into_iter()
            .map(|v| {
                v.map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .collect())
    }

    pub(super) fn required_ids(df: &DataFrame, name: &str) -> Result<Vec<String>, DataError> {
        string_values(df, name)?
            .into_iter()
            .enumerate()
            .map(|(i, id)| id.ok_or(DataError::MissingPlotId(i + 1)))
            .collect()
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_file(content: &str, suffix: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        writeln!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn plot_table_rejects_duplicate_plot_ids() {
        let err = PlotTable::new(
            vec!["p1".into(), "p1".into()],
            vec!["a".into()],
            vec![vec![1.0, 2.0]],
        )
        .unwrap_err();
        match err {
            DataError::DuplicatePlotId(id) => assert_eq!(id, "p1"),
            other => panic!("Expected DuplicatePlotId, got {:?}", other),
        }
    }

    #[test]
    fn plot_table_rejects_ragged_columns() {
        let err = PlotTable::new(
            vec!["p1".into(), "p2".into()],
            vec!["a".into()],
            vec![vec![1.0]],
        )
        .unwrap_err();
        assert!(matches!(err, DataError::RaggedColumn { found: 1, expected: 2, .. }));
    }

    #[test]
    fn select_rows_and_matrix_follow_requested_order() {
        let table = PlotTable::new(
            vec!["p1".into(), "p2".into(), "p3".into()],
            vec!["a".into(), "b".into()],
            vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, f64::NAN]],
        )
        .unwrap();
        let subset = table.select_rows(&[2, 0]);
        assert_eq!(subset.plot_ids(), &["p3".to_string(), "p1".to_string()]);

        let m = subset.matrix(&["b".to_string(), "a".to_string()]).unwrap();
        assert!(m[[0, 0]].is_nan());
        assert_abs_diff_eq!(m[[0, 1]], 3.0);
        assert_abs_diff_eq!(m[[1, 0]], 10.0);

        let err = table.matrix(&["missing".to_string()]).unwrap_err();
        assert!(matches!(err, DataError::ColumnNotFound(name) if name == "missing"));
    }

    #[test]
    fn load_feature_table_reads_numeric_columns_and_nulls() {
        let content = "plot_id,NDVI_q50_20210715,note,canopy_area_20210715\n\
                       A1,0.5,ok,0.25\n\
                       A2,,ok,0.30\n\
                       A3,0.7,bad,0.35";
        let file = create_test_file(content, ".csv");
        let table = load_feature_table(file.path(), "plot_id").unwrap();

        assert_eq!(table.n_plots(), 3);
        assert_eq!(
            table.names(),
            &["NDVI_q50_20210715".to_string(), "canopy_area_20210715".to_string()]
        );
        let ndvi = table.column("NDVI_q50_20210715").unwrap();
        assert_abs_diff_eq!(ndvi[0], 0.5);
        assert!(ndvi[1].is_nan());
        assert_eq!(table.row_of("A3"), Some(2));
    }

    #[test]
    fn load_feature_table_keeps_columns_with_r_style_missing_and_infinite_cells() {
        let content = "plot_id,ratio_q50_20210715,NDVI_q50_20210715,elev_soil_q05_20210610\n\
                       A1,1.5,0.5,250.1\n\
                       A2,Inf,0.6,NA\n\
                       A3,-Inf,NA,250.3\n\
                       A4,2.0,0.7,250.2";
        let file = create_test_file(content, ".csv");
        let table = load_feature_table(file.path(), "plot_id").unwrap();

        assert_eq!(
            table.names(),
            &[
                "ratio_q50_20210715".to_string(),
                "NDVI_q50_20210715".to_string(),
                "elev_soil_q05_20210610".to_string(),
            ]
        );
        let ratio = table.column("ratio_q50_20210715").unwrap();
        assert_eq!(ratio[1], f64::INFINITY);
        assert_eq!(ratio[2], f64::NEG_INFINITY);
        assert_abs_diff_eq!(ratio[3], 2.0);
        assert!(table.column("NDVI_q50_20210715").unwrap()[2].is_nan());
        let soil = table.column("elev_soil_q05_20210610").unwrap();
        assert!(soil[1].is_nan());
        assert_abs_diff_eq!(soil[2], 250.3);

        // Engineering turns the infinite cells into missing values.
        let spec = crate::features::FeatureSpec {
            reference_soil_column: "elev_soil_q05_20210610".to_string(),
            ..crate::features::FeatureSpec::default()
        };
        let (engineered, report) = crate::features::engineer_features(&table, &spec).unwrap();
        let ratio = engineered.column("ratio_q50_20210715").unwrap();
        assert!(ratio[1].is_nan() && ratio[2].is_nan());
        assert_eq!(report.non_finite_replaced, 2);
    }

    #[test]
    fn load_feature_table_skips_truly_textual_columns() {
        let file = create_test_file("plot_id,x,tag\nA1,1.0,Inf\nA2,2.0,early", ".csv");
        let table = load_feature_table(file.path(), "plot_id").unwrap();
        assert_eq!(table.names(), &["x".to_string()]);
    }

    #[test]
    fn load_feature_table_requires_id_column() {
        let file = create_test_file("plot,x\nA1,1.0\nA2,2.0", ".csv");
        let err = load_feature_table(file.path(), "plot_id").unwrap_err();
        match err {
            DataError::ColumnNotFound(col) => assert_eq!(col, "plot_id"),
            other => panic!("Expected ColumnNotFound, got {:?}", other),
        }
    }

    #[test]
    fn load_feature_table_rejects_duplicate_ids() {
        let file = create_test_file("plot_id,x\nA1,1.0\nA1,2.0", ".csv");
        let err = load_feature_table(file.path(), "plot_id").unwrap_err();
        assert!(matches!(err, DataError::DuplicatePlotId(id) if id == "A1"));
    }

    #[test]
    fn load_design_table_reads_tab_separated_design() {
        let content = "plot_id\texperiment\tpedigree\trep\trow\trange\tanthesis_gdd\n\
                       A1\tG2F\tB73\t1\t1\t1\t1350.5\n\
                       A2\tG2F\tMo17\t1\t1\t2\t\n\
                       A3\tOTHER\tB73\t2\t2\t1\t1362";
        let file = create_test_file(content, ".tsv");
        let design = load_design_table(file.path(), &DesignColumns::default()).unwrap();

        assert_eq!(design.records().len(), 3);
        let a2 = design.get("A2").unwrap();
        assert_eq!(a2.pedigree, "Mo17");
        assert_eq!(a2.replicate, "1");
        assert_eq!(a2.column, Some(2));
        assert_eq!(a2.flowering_gdd, None);

        let labels = design.labels();
        assert_eq!(labels.len(), 2);
        assert_abs_diff_eq!(labels["A1"], 1350.5);

        let g2f = design.plots_in_experiments(&["G2F".to_string()]);
        assert!(g2f.contains("A1") && g2f.contains("A2") && !g2f.contains("A3"));
    }

    #[test]
    fn load_design_table_reads_na_as_unscored() {
        let content = "plot_id,experiment,pedigree,rep,row,range,anthesis_gdd\n\
                       A1,G2F,B73,1,1,1,1340.5\n\
                       A2,G2F,Mo17,1,NA,2,NA\n\
                       A3,G2F,W22,2,2,1,1371";
        let file = create_test_file(content, ".csv");
        let design = load_design_table(file.path(), &DesignColumns::default()).unwrap();

        let a2 = design.get("A2").unwrap();
        assert_eq!(a2.flowering_gdd, None);
        assert_eq!(a2.row, None);
        assert_eq!(a2.column, Some(2));

        let labels = design.labels();
        assert_eq!(labels.len(), 2);
        assert!(!labels.contains_key("A2"));
        assert_abs_diff_eq!(labels["A3"], 1371.0);
    }

    #[test]
    fn select_columns_keeps_requested_order_and_rejects_unknown_names() {
        let table = PlotTable::new(
            vec!["p1".into(), "p2".into()],
            vec!["a".into(), "b".into(), "c".into()],
            vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]],
        )
        .unwrap();
        let subset = table.select_columns(&["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(subset.names(), &["c".to_string(), "a".to_string()]);
        assert_eq!(subset.column("c").unwrap(), &[5.0, 6.0]);
        assert_eq!(subset.plot_ids(), table.plot_ids());

        let err = table.select_columns(&["z".to_string()]).unwrap_err();
        assert!(matches!(err, DataError::ColumnNotFound(name) if name == "z"));
    }

    #[test]
    fn load_design_table_accepts_entirely_blank_flowering_column() {
        let content = "plot_id,experiment,pedigree,rep,row,range,anthesis_gdd\n\
                       A1,G2F,B73,1,1,1,\n\
                       A2,G2F,Mo17,1,1,2,";
        let file = create_test_file(content, ".csv");
        let design = load_design_table(file.path(), &DesignColumns::default()).unwrap();
        assert!(design.labels().is_empty());
    }
}
