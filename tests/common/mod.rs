//! Synthetic season on disk: a drone summary, a trial design and a season
//! configuration in a temporary directory.
//!
//! Layout: 60 genotypes x 2 replicates in experiment `YT`, plus 4 plots of an
//! observation nursery `OBS`. Flowering time is driven by a genotype effect.
//! Canopy height and one NDVI feature track flowering time; the other
//! features are noise or genotype-only signals. Genotypes 40..50 are left
//! unscored in both replicates.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const GENOTYPES: usize = 60;
pub const UNSCORED: std::ops::Range<usize> = 40..50;
pub const EXCLUDED: [&str; 2] = ["P1-045", "P2-047"];
pub const REFERENCE_SOIL: &str = "elev_soil_q05_20210610";

pub struct SyntheticSeason {
    pub dir: TempDir,
    pub config_path: PathBuf,
    /// True flowering time of every plot, scored or not.
    pub truth: HashMap<String, f64>,
}

impl SyntheticSeason {
    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }
}

fn plot_id(rep: usize, geno: usize) -> String {
    format!("P{rep}-{geno:03}")
}

fn cell(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.6}")
    } else {
        String::new()
    }
}

pub fn build(seed: u64) -> SyntheticSeason {
    let mut rng = StdRng::seed_from_u64(seed);
    let std_normal = Normal::new(0.0, 1.0).unwrap();
    let mut draw = |sd: f64| sd * std_normal.sample(&mut rng);

    let flowering_effect: Vec<f64> = (0..GENOTYPES).map(|_| draw(40.0)).collect();
    let greenness_effect: Vec<f64> = (0..GENOTYPES).map(|_| draw(0.05)).collect();
    let area_effect: Vec<f64> = (0..GENOTYPES).map(|_| draw(0.08)).collect();

    let mut features = String::from(
        "plot_id,index,elev_soil_q05_20210610,elev_soil_q50_20210610,elev_veg_q95_20210715,\
         elev_veg_q50_20210715,NDVI_q50_20210701,NDVI_q50_20210715,ExG_q50_20210701,\
         ExG_q90_20210715,canopy_area_20210715,GLI_q50_20210701,broken_q50_20210701,flat_q50_20210701\n",
    );
    let mut design = String::from("plot_id,experiment,pedigree,rep,row,range,anthesis_gdd\n");
    let mut truth = HashMap::new();

    let mut index = 0;
    for rep in 1..=2 {
        for geno in 0..GENOTYPES {
            let id = plot_id(rep, geno);
            let gdd = 1300.0 + flowering_effect[geno] + draw(8.0);
            truth.insert(id.clone(), gdd);

            let soil = 250.0 + 0.3 * (geno as f64 / 7.0).sin() + draw(0.2);
            let height = 2.0 + 0.004 * (gdd - 1300.0) + draw(0.03);
            let gli = if index % 17 == 3 { f64::NAN } else { 0.1 + draw(0.02) };
            writeln!(
                features,
                "{id},{index},{},{},{},{},{},{},{},{},{},{},1.0,3.0",
                cell(soil),
                cell(soil + 0.01 + draw(0.01)),
                cell(soil + height),
                cell(soil + 0.6 * height + draw(0.02)),
                cell(0.6 + 0.001 * (gdd - 1300.0) + draw(0.01)),
                cell(0.7 + greenness_effect[geno] + draw(0.02)),
                cell(0.2 + draw(0.05)),
                cell(0.4 + draw(0.05)),
                cell(0.5 + area_effect[geno] + draw(0.03)),
                cell(gli),
            )
            .unwrap();

            let label = if UNSCORED.contains(&geno) {
                String::new()
            } else {
                cell(gdd)
            };
            writeln!(design, "{id},YT,G{geno:03},{rep},{rep},{},{label}", geno + 1).unwrap();
            index += 1;
        }
    }

    // Observation nursery: outside every configured experiment.
    for k in 0..4 {
        let id = format!("OBS-{k}");
        let soil = 251.0 + draw(0.2);
        writeln!(
            features,
            "{id},{index},{},{},{},{},{},{},{},{},{},{},2.0,3.0",
            cell(soil),
            cell(soil + 0.01),
            cell(soil + 2.0),
            cell(soil + 1.2),
            cell(0.6),
            cell(0.7),
            cell(0.2),
            cell(0.4),
            cell(0.5),
            cell(0.1),
        )
        .unwrap();
        writeln!(design, "{id},OBS,N{k},1,3,{},", k + 1).unwrap();
        index += 1;
    }

    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("summary.csv"), features).unwrap();
    fs::write(dir.path().join("design.csv"), design).unwrap();

    let config = format!(
        r#"season = "2021"
output_dir = "out"

[inputs]
features = "summary.csv"
design = "design.csv"

[features]
reference_soil_column = "{REFERENCE_SOIL}"

[heritability]
reference_experiment = "YT"

[regression]
experiments = ["YT"]
seed = {seed}

[inference]
exclude_plots = ["{}", "{}"]
"#,
        EXCLUDED[0], EXCLUDED[1]
    );
    let config_path = dir.path().join("season.toml");
    fs::write(&config_path, config).unwrap();

    SyntheticSeason {
        dir,
        config_path,
        truth,
    }
}

/// Reads a CSV written by the pipeline into header + rows.
pub fn read_csv(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader
        .headers()
        .unwrap()
        .iter()
        .map(str::to_string)
        .collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}
