mod common;

use anthesis::config::SeasonConfig;
use anthesis::regress::model::TrainedModel;
use anthesis::report;
use anthesis::season::{SeasonInputs, run_inference_from_file, run_season};
use std::collections::HashSet;

#[test]
fn full_season_writes_every_output() {
    let season = common::build(11);
    let config = SeasonConfig::load(&season.config_path).unwrap();
    let summary = run_season(&config).unwrap();

    assert_eq!(summary.season, "2021");
    assert_eq!(summary.n_plots, 2 * common::GENOTYPES + 4);
    assert_eq!(summary.n_features, 9);
    assert!(summary.heritability_defined >= 1);
    assert!(summary.heritability_defined < summary.heritability_total);

    let out = season.output_dir();
    for name in [
        report::FEATURES,
        report::HERITABILITY,
        report::HERITABILITY_BY_TYPE,
        report::HERITABILITY_OVER_TIME,
        report::CV_CURVE,
        report::COEFFICIENTS,
        report::TEST_PREDICTIONS,
        report::PREDICTIONS,
        report::REPLICATE_PAIRS,
        report::REPLICATE_CONCORDANCE,
        report::SPATIAL_MAP,
        report::MODEL,
    ] {
        assert!(out.join(name).exists(), "missing output {name}");
    }

    // Heights replace canopy elevations; soil columns never reach the output.
    let (header, rows) = common::read_csv(&out.join(report::FEATURES));
    assert!(header.iter().any(|h| h == "height_q95_20210715"));
    assert!(header.iter().all(|h| !h.contains("elev_")));
    assert!(!header.iter().any(|h| h == "index"));
    assert_eq!(rows.len(), summary.n_plots);
}

#[test]
fn model_predicts_held_out_plots() {
    let season = common::build(12);
    let config = SeasonConfig::load(&season.config_path).unwrap();
    let summary = run_season(&config).unwrap();

    let metrics = &summary.test_metrics;
    assert!(metrics.rsq.unwrap() > 0.5, "test R² {:?}", metrics.rsq);
    assert!(metrics.spearman.unwrap() > 0.5);
    // 100 scored plots split 75/25 within four strata.
    assert_eq!(metrics.n, 24);

    let model = TrainedModel::load(&season.output_dir().join(report::MODEL)).unwrap();
    let nonzero = model.nonzero_coefficients();
    assert!(!nonzero.is_empty());
    let informative: HashSet<&str> = ["height_q95_20210715", "height_q50_20210715", "NDVI_q50_20210701"]
        .into_iter()
        .collect();
    assert!(informative.contains(nonzero[0].feature.as_str()));
    assert_eq!(model.cv_curve.len(), 50);
    assert!(model.cv_curve.iter().any(|p| p.mean_rsq.is_none()));
}

#[test]
fn inference_covers_unscored_plots_minus_exclusions() {
    let season = common::build(13);
    let config = SeasonConfig::load(&season.config_path).unwrap();
    run_season(&config).unwrap();

    let (header, rows) = common::read_csv(&season.output_dir().join(report::PREDICTIONS));
    assert_eq!(header, vec!["plot_id", "predicted_gdd"]);
    let ids: HashSet<String> = rows.iter().map(|r| r[0].clone()).collect();

    // Ten unscored genotypes in two replicates, two of them excluded.
    assert_eq!(ids.len(), 18);
    for excluded in common::EXCLUDED {
        assert!(!ids.contains(excluded));
    }
    // Nursery plots sit outside the configured experiment.
    assert!(ids.iter().all(|id| id.starts_with('P')));

    // Predictions follow the hidden truth.
    let predicted: Vec<f64> = rows.iter().map(|r| r[1].parse().unwrap()).collect();
    let truth: Vec<f64> = rows.iter().map(|r| season.truth[&r[0]]).collect();
    let rho = anthesis::stats::spearman(&predicted, &truth).unwrap();
    assert!(rho > 0.5, "spearman {rho}");

    // Eight genotypes are predicted in both replicates.
    let (_, pairs) = common::read_csv(&season.output_dir().join(report::REPLICATE_PAIRS));
    assert_eq!(pairs.len(), 8);
    let (_, concordance) = common::read_csv(&season.output_dir().join(report::REPLICATE_CONCORDANCE));
    assert_eq!(concordance.len(), 1);
    assert_eq!(concordance[0][2], "8");
}

#[test]
fn saved_model_reproduces_season_predictions() {
    let season = common::build(14);
    let config = SeasonConfig::load(&season.config_path).unwrap();
    run_season(&config).unwrap();
    let (_, first) = common::read_csv(&season.output_dir().join(report::PREDICTIONS));

    let model_path = season.output_dir().join(report::MODEL);
    let predictions = run_inference_from_file(&config, &model_path).unwrap();
    assert_eq!(predictions.len(), first.len());
    for (record, row) in predictions.iter().zip(&first) {
        assert_eq!(record.plot_id, row[0]);
        let written: f64 = row[1].parse().unwrap();
        assert!((record.predicted_gdd - written).abs() < 1e-6 * written.abs());
    }
}

#[test]
fn missing_reference_soil_column_fails_loudly() {
    let season = common::build(15);
    let mut config = SeasonConfig::load(&season.config_path).unwrap();
    config.features.reference_soil_column = "elev_soil_q05_20220612".to_string();
    let err = SeasonInputs::load(&config).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("elev_soil_q05_20220612"), "{message}");
    assert!(message.contains(common::REFERENCE_SOIL), "{message}");
}
