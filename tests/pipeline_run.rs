mod common;

use forensic_fusion::{
    evaluation::perturb::{Perturbation, Scenario},
    features::{FeatureTable, Split},
    pipeline::{run_pipeline, run_tuning},
    training::{ModelBundle, TuningMode},
};
use serde_json::Value;

fn read_csv_rows(path: &std::path::Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(path).unwrap();
    reader.records().collect::<Result<_, _>>().unwrap()
}

#[test]
fn full_run_writes_every_artifact() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let manifest = common::write_dataset(dir.path(), 32);
    let mut config = common::small_config(dir.path(), &manifest);
    config.robustness.enabled = true;
    config.robustness.scenarios = vec![Scenario::new("jpeg_q70", Perturbation::Jpeg { quality: 70 })];

    let result = run_pipeline(&config).unwrap();

    let table = FeatureTable::read_csv(&result.feature_table_path).unwrap();
    assert_eq!(table.len(), 32);
    assert_eq!(table.split_rows(Split::Test).count(), 8);

    let summary = read_csv_rows(&result.summary_metrics_path);
    assert_eq!(summary.len(), config.experiment.methods.len());

    let bootstrap = read_csv_rows(&result.bootstrap_path);
    assert_eq!(bootstrap.len(), config.experiment.methods.len() * 4);

    let stats = read_csv_rows(&result.stats_path);
    assert_eq!(stats.len(), config.experiment.methods.len() - 1);

    let robustness = read_csv_rows(&result.robustness_path);
    assert_eq!(robustness.len(), config.experiment.methods.len());
    assert!(robustness.iter().all(|r| &r[0] == "jpeg_q70"));

    let localization = read_csv_rows(&result.localization_path);
    assert_eq!(localization.len(), 3);

    assert!(result.error_analysis_path.exists());

    let report = std::fs::read_to_string(&result.report_path).unwrap();
    assert!(report.starts_with("# Experiment Report: integration"));
    assert!(report.contains("## Robustness Metrics"));

    let bundle = ModelBundle::load(&result.bundle_path).unwrap();
    assert_eq!(bundle.model_version, result.model_version);
    assert_eq!(bundle.methods.len(), config.experiment.methods.len());
    let primary = bundle.primary().unwrap();
    assert!(primary.threshold > 0.0 && primary.threshold < 1.0);
    assert_eq!(bundle.summary_metrics.len(), config.experiment.methods.len());

    let result_json: Value =
        serde_json::from_str(&std::fs::read_to_string(config.paths.reports_dir.join("pipeline_result.json")).unwrap())
            .unwrap();
    assert_eq!(result_json["model_version"], Value::String(result.model_version.clone()));
}

#[test]
fn tuning_reuses_the_feature_table() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let manifest = common::write_dataset(dir.path(), 32);
    let config = common::small_config(dir.path(), &manifest);
    let run = run_pipeline(&config).unwrap();

    let tuned = run_tuning(&config, Some(&run.feature_table_path), TuningMode::SingleStage).unwrap();

    let stats = read_csv_rows(&tuned.stats_path);
    assert_eq!(stats.len(), 1);

    let bundle = ModelBundle::load(&tuned.bundle_path).unwrap();
    assert!(bundle.model_version.contains("-tuned-"));
    let primary = bundle.primary().unwrap();
    assert!(primary.tuning.is_some());
    assert!(primary.split_metrics.keys().all(|s| *s != Split::Train));
    assert!(bundle.method(&config.experiment.baseline_method).is_some());

    let summary: Value = serde_json::from_str(&std::fs::read_to_string(&tuned.summary_path).unwrap()).unwrap();
    assert_eq!(summary["mode"], "single_stage");
    assert_eq!(summary["n_candidates"], 36);
    let n_failed = summary["n_failed"].as_u64().unwrap() as usize;
    let sweep = read_csv_rows(&tuned.sweep_path);
    assert_eq!(sweep.len(), 36 - n_failed);
    assert!(!sweep.is_empty());
}

#[test]
fn missing_manifest_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::small_config(dir.path(), &dir.path().join("absent.csv"));
    assert!(run_pipeline(&config).is_err());
}
