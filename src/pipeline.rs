//! End-to-end runs: the full experiment, the primary-method tuning sweep and
//! the re-evaluation of a persisted bundle.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    config::LabConfig,
    error::{ForensicsError, Result},
    evaluation::{
        BootstrapRow, MethodSummaryRow, PredictionRow, error_analysis::build_error_analysis_table,
        labels_and_probabilities, localization::run_localization_suite,
        metrics::{BootstrapMetric, bootstrap_metric_ci, compute_binary_metrics},
        robustness::{MethodScorer, ScenarioPrediction, run_robustness_suite, run_scenarios, summarize_robustness},
        statistics::run_method_comparison_stats,
    },
    features::{FeatureTable, Split, build_feature_table, read_manifest},
    report::{ExperimentReport, write_csv, write_json},
    training::{MethodPayload, ModelBundle, TrainedModel, TuningMode, train_methods, tune_primary},
};

const ASSUMPTIONS: [&str; 4] = [
    "Labels and splits are taken verbatim from the manifest.",
    "Localization metrics use proxy maps (CFA, PRNU residual, heuristic mask) against available ground-truth masks.",
    "Statistical tests compare per-image correctness vectors on the same test split.",
    "Thresholds are selected on validation and reused unchanged under perturbation.",
];

/// Paths of everything a full run writes.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_name: String,
    pub feature_table_path: PathBuf,
    pub summary_metrics_path: PathBuf,
    pub bootstrap_path: PathBuf,
    pub stats_path: PathBuf,
    pub robustness_path: PathBuf,
    pub robustness_predictions_path: PathBuf,
    pub localization_path: PathBuf,
    pub error_analysis_path: PathBuf,
    pub report_path: PathBuf,
    pub bundle_path: PathBuf,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TuningResult {
    pub sweep_path: PathBuf,
    pub stats_path: PathBuf,
    /// Best-by-test candidate against the baseline; two-stage runs only.
    pub reference_stats_path: Option<PathBuf>,
    pub bundle_path: PathBuf,
    pub summary_path: PathBuf,
    pub model_version: String,
}

pub fn ensure_output_dirs(config: &LabConfig) -> Result<()> {
    for dir in config.paths.output_dirs() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}

pub fn default_feature_table_path(config: &LabConfig) -> PathBuf {
    config.paths.metrics_dir.join("feature_table.csv")
}

pub fn default_bundle_path(config: &LabConfig) -> PathBuf {
    config.paths.models_dir.join("model_bundle.json")
}

pub fn main_summary(models: &BTreeMap<String, TrainedModel>) -> Vec<MethodSummaryRow> {
    models
        .iter()
        .filter_map(|(method, model)| model.metrics(Split::Test).map(|m| MethodSummaryRow::new(method, m)))
        .collect()
}

pub fn bootstrap_summary(models: &BTreeMap<String, TrainedModel>, config: &LabConfig) -> Result<Vec<BootstrapRow>> {
    let mut rows = Vec::new();
    for (method, model) in models {
        let (y_true, y_prob) = labels_and_probabilities(model.split_predictions(Split::Test));
        for metric in BootstrapMetric::ALL {
            let interval = bootstrap_metric_ci(
                &y_true,
                &y_prob,
                model.threshold,
                metric,
                config.evaluation.bootstrap_samples,
                config.evaluation.confidence_level,
                config.experiment.seed,
            )?;
            rows.push(BootstrapRow::new(method, &interval));
        }
    }
    Ok(rows)
}

/// Manifest to report: extraction, training, evaluation suites and export.
pub fn run_pipeline(config: &LabConfig) -> Result<PipelineResult> {
    ensure_output_dirs(config)?;
    let run_name = format!("{}_{}", config.experiment.name, Utc::now().format("%Y%m%d_%H%M%S"));
    log::info!("Starting run {}", run_name);

    let manifest = read_manifest(&config.paths.manifest_csv)?;
    log::info!("Loaded {} manifest rows from {}", manifest.len(), config.paths.manifest_csv.display());

    let table = build_feature_table(&manifest, config)?;
    let feature_table_path = default_feature_table_path(config);
    table.write_csv(&feature_table_path)?;
    log::info!("Feature table saved: {}", feature_table_path.display());

    let models = train_methods(&table, config)?;
    let metrics_dir = &config.paths.metrics_dir;
    let reports_dir = &config.paths.reports_dir;

    let summary = main_summary(&models);
    let summary_metrics_path = metrics_dir.join("main_metrics.csv");
    write_csv(&summary_metrics_path, &summary)?;

    let bootstrap = bootstrap_summary(&models, config)?;
    let bootstrap_path = metrics_dir.join("bootstrap_ci.csv");
    write_csv(&bootstrap_path, &bootstrap)?;

    let test_predictions: BTreeMap<String, Vec<PredictionRow>> = models
        .iter()
        .map(|(method, model)| (method.clone(), model.split_predictions(Split::Test).to_vec()))
        .collect();
    let statistics = run_method_comparison_stats(&test_predictions, &config.experiment.primary_method)?;
    let stats_path = metrics_dir.join("method_stats.csv");
    write_csv(&stats_path, &statistics)?;

    let test_rows: Vec<_> = table.split_rows(Split::Test).cloned().collect();
    let robustness = run_robustness_suite(&test_rows, &models, config)?;
    let robustness_path = metrics_dir.join("robustness_metrics.csv");
    write_csv(&robustness_path, &robustness.rows)?;
    let robustness_predictions: Vec<ScenarioPrediction> = robustness.predictions.values().flatten().cloned().collect();
    let robustness_predictions_path = metrics_dir.join("robustness_predictions.csv");
    write_csv(&robustness_predictions_path, &robustness_predictions)?;

    let localization = run_localization_suite(&test_rows, config);
    let localization_path = metrics_dir.join("localization_metrics.csv");
    write_csv(&localization_path, &localization)?;

    let primary_predictions = test_predictions
        .get(&config.experiment.primary_method)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let errors = build_error_analysis_table(primary_predictions, config.evaluation.error_top_k);
    let error_analysis_path = reports_dir.join("error_analysis.csv");
    write_csv(&error_analysis_path, &errors)?;

    let bundle = ModelBundle::from_models(&models, config, summary.clone());
    let bundle_path = default_bundle_path(config);
    bundle.save(&bundle_path)?;

    let report_path = reports_dir.join("experiment_report.md");
    ExperimentReport {
        experiment_name: &config.experiment.name,
        assumptions: &ASSUMPTIONS,
        summary: &summary,
        bootstrap: &bootstrap,
        robustness: &robustness.rows,
        localization: &localization,
        statistics: &statistics,
        errors: &errors,
    }
    .write(&report_path)?;

    let result = PipelineResult {
        run_name,
        feature_table_path,
        summary_metrics_path,
        bootstrap_path,
        stats_path,
        robustness_path,
        robustness_predictions_path,
        localization_path,
        error_analysis_path,
        report_path,
        bundle_path,
        model_version: bundle.model_version,
    };
    write_json(reports_dir.join("pipeline_result.json"), &result)?;
    log::info!("Pipeline finished. Bundle: {}", result.bundle_path.display());
    Ok(result)
}

/// Sweeps the primary method on an existing feature table.
pub fn run_tuning(config: &LabConfig, feature_table: Option<&Path>, mode: TuningMode) -> Result<TuningResult> {
    ensure_output_dirs(config)?;
    let table_path = feature_table.map_or_else(|| default_feature_table_path(config), Path::to_path_buf);
    let table = FeatureTable::read_csv(&table_path)?;
    log::info!("Loaded {} feature rows from {}", table.len(), table_path.display());

    let outcome = tune_primary(&table, config, mode)?;

    let sweep_path = config.paths.metrics_dir.join("primary_tuning_sweep.csv");
    write_csv(&sweep_path, &outcome.sweep.rows)?;
    let stats_path = config.paths.metrics_dir.join("primary_vs_baseline_stats.csv");
    write_csv(&stats_path, std::slice::from_ref(&outcome.comparison))?;
    let reference_stats_path = match &outcome.reference_comparison {
        Some(comparison) => {
            let path = config
                .paths
                .metrics_dir
                .join("primary_stage2_besttest_vs_baseline_stats.csv");
            write_csv(&path, std::slice::from_ref(comparison))?;
            Some(path)
        }
        None => None,
    };

    let bundle = outcome.to_bundle(config);
    let bundle_path = config.paths.models_dir.join("final_primary_artifact_tuned.json");
    bundle.save(&bundle_path)?;

    let summary = outcome.summary();
    let summary_path = config.paths.reports_dir.join("primary_tuning_summary.json");
    write_json(&summary_path, &summary)?;
    log::info!(
        "Tuned {} test F1 {:.4} vs baseline {:.4}",
        summary.primary_method,
        summary.tuned_primary_test_f1,
        summary.baseline_test_f1
    );

    Ok(TuningResult {
        sweep_path,
        stats_path,
        reference_stats_path,
        bundle_path,
        summary_path,
        model_version: bundle.model_version,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub model_version: String,
    pub primary_method: String,
    pub main_metrics_path: PathBuf,
    pub stats_path: PathBuf,
    pub robustness_path: PathBuf,
    pub robustness_summary_path: PathBuf,
    pub error_analysis_path: PathBuf,
    pub summary_path: PathBuf,
}

/// Test-split predictions of a stored payload, scored with its frozen threshold.
fn payload_test_predictions(
    table: &FeatureTable,
    method: &str,
    payload: &MethodPayload,
) -> Result<(MethodSummaryRow, Vec<PredictionRow>)> {
    let data = table.split_data(Split::Test, &payload.feature_columns)?;
    let probs = payload.pipeline.predict_proba(&data.x)?;
    let threshold = payload.threshold;
    let metrics = compute_binary_metrics(&data.y, &probs, threshold)?;
    let rows = data
        .paths
        .iter()
        .zip(&data.y)
        .zip(&probs)
        .map(|((path, &label), &p)| PredictionRow::new(path.clone(), label, p, threshold))
        .collect();
    Ok((MethodSummaryRow::new(method, &metrics), rows))
}

/// Re-scores every method of a persisted bundle on the test split of a feature
/// table, then runs the comparison, robustness and error-analysis suites.
///
/// Nothing is refitted. Robustness always runs the configured scenarios, with
/// the feature settings and image size frozen in the bundle.
pub fn run_evaluation(
    config: &LabConfig,
    bundle_path: Option<&Path>,
    feature_table: Option<&Path>,
) -> Result<EvaluationResult> {
    ensure_output_dirs(config)?;
    let bundle_path = bundle_path.map_or_else(|| default_bundle_path(config), Path::to_path_buf);
    let bundle = ModelBundle::load(&bundle_path)?;
    if bundle.primary().is_none() {
        return Err(ForensicsError::UnknownMethod(bundle.primary_method.clone()));
    }
    let table_path = feature_table.map_or_else(|| default_feature_table_path(config), Path::to_path_buf);
    let table = FeatureTable::read_csv(&table_path)?;
    log::info!(
        "Evaluating bundle {} ({} methods) on {}",
        bundle.model_version,
        bundle.methods.len(),
        table_path.display()
    );

    let mut main_metrics = Vec::new();
    let mut test_predictions = BTreeMap::new();
    for (method, payload) in &bundle.methods {
        let (summary, rows) = payload_test_predictions(&table, method, payload)?;
        log::info!("{}: test F1 {:.4} at threshold {:.4}", method, summary.f1, summary.threshold);
        main_metrics.push(summary);
        test_predictions.insert(method.clone(), rows);
    }
    main_metrics.sort_by(|a, b| b.f1.total_cmp(&a.f1));

    let metrics_dir = &config.paths.metrics_dir;
    let reports_dir = &config.paths.reports_dir;

    let main_metrics_path = metrics_dir.join("bundle_eval_main_metrics.csv");
    write_csv(&main_metrics_path, &main_metrics)?;

    let statistics = run_method_comparison_stats(&test_predictions, &bundle.primary_method)?;
    let stats_path = metrics_dir.join("bundle_eval_stats.csv");
    write_csv(&stats_path, &statistics)?;

    let test_rows: Vec<_> = table.split_rows(Split::Test).cloned().collect();
    let robustness = run_scenarios(
        &test_rows,
        &bundle.methods,
        &config.robustness.scenarios,
        &bundle.config.features,
        bundle.config.experiment.image_size,
        config.experiment.seed,
    )?;
    let robustness_path = metrics_dir.join("bundle_eval_robustness_metrics.csv");
    write_csv(&robustness_path, &robustness.rows)?;

    let clean_f1: BTreeMap<String, f64> = bundle
        .methods
        .iter()
        .map(|(method, payload)| (method.clone(), payload.clean_test_f1()))
        .collect();
    let robustness_summary = summarize_robustness(&robustness.rows, &clean_f1);
    let robustness_summary_path = metrics_dir.join("bundle_eval_robustness_summary.csv");
    write_csv(&robustness_summary_path, &robustness_summary)?;

    let primary_predictions = test_predictions
        .get(&bundle.primary_method)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let errors = build_error_analysis_table(primary_predictions, config.evaluation.error_top_k);
    let error_analysis_path = reports_dir.join("bundle_eval_error_analysis.csv");
    write_csv(&error_analysis_path, &errors)?;

    let result = EvaluationResult {
        model_version: bundle.model_version.clone(),
        primary_method: bundle.primary_method.clone(),
        main_metrics_path,
        stats_path,
        robustness_path,
        robustness_summary_path,
        error_analysis_path,
        summary_path: reports_dir.join("bundle_eval_summary.json"),
    };
    write_json(&result.summary_path, &result)?;
    log::info!("Bundle evaluation finished: {}", result.summary_path.display());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ClassifierSpec, PipelineSpec, forest::ForestParams},
        training::fixtures::synthetic_table,
    };

    fn config() -> LabConfig {
        let mut config = LabConfig::default();
        config.experiment.methods = vec!["ela_only".into(), "ela_dwt".into(), "ela_dwt_svd".into()];
        config.evaluation.bootstrap_samples = 50;
        config
    }

    #[test]
    fn summaries_cover_every_method() {
        let config = config();
        let models = train_methods(&synthetic_table(), &config).unwrap();
        let summary = main_summary(&models);
        let methods: Vec<&str> = summary.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(methods, vec!["ela_dwt", "ela_dwt_svd", "ela_only"]);

        let bootstrap = bootstrap_summary(&models, &config).unwrap();
        assert_eq!(bootstrap.len(), 12);
        assert!(bootstrap.iter().all(|r| r.ci_lower <= r.ci_upper));
    }

    #[test]
    fn tuning_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.paths.resolve_against(dir.path());
        config.tuning.candidates = Some(vec![Default::default()]);
        synthetic_table().write_csv(default_feature_table_path(&config)).unwrap();

        let result = run_tuning(&config, None, TuningMode::SingleStage).unwrap();
        for path in [&result.sweep_path, &result.stats_path, &result.bundle_path, &result.summary_path] {
            assert!(path.exists(), "{} missing", path.display());
        }
        let bundle = ModelBundle::load(&result.bundle_path).unwrap();
        assert_eq!(bundle.model_version, result.model_version);
        assert!(bundle.primary().is_some());
        assert!(result.reference_stats_path.is_none());
    }

    #[test]
    fn two_stage_tuning_compares_best_by_test_with_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.paths.resolve_against(dir.path());
        config.tuning.candidates = Some(vec![
            Default::default(),
            PipelineSpec::new(ClassifierSpec::RandomForest(ForestParams::default()), None),
        ]);
        synthetic_table().write_csv(default_feature_table_path(&config)).unwrap();

        let result = run_tuning(&config, None, TuningMode::TwoStage).unwrap();
        let path = result.reference_stats_path.unwrap();
        assert_eq!(path.file_name().unwrap(), "primary_stage2_besttest_vs_baseline_stats.csv");

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        let column = |name: &str| headers.iter().position(|h| h == name).unwrap();
        assert_eq!(&records[0][column("primary_method")], "ela_dwt_svd");
        assert_eq!(&records[0][column("baseline_method")], "ela_dwt");
        let p_value: f64 = records[0][column("p_value")].parse().unwrap();
        assert!((0.0..=1.0).contains(&p_value));
    }
}
