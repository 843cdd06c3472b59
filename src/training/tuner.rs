//! Hyperparameter sweep for the primary method.
//!
//! Candidates are fitted and thresholded on validation exactly like a plain
//! training run. The winner is chosen on validation metrics alone; the
//! best-by-test candidate of the two-stage mode is kept as a
//! [`ReferenceCandidate`], which carries no pipeline and so can never be
//! written into a bundle.

use std::{cmp::Ordering, collections::BTreeMap, fmt, str::FromStr};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::{LabConfig, ThresholdConfig},
    error::{ForensicsError, Result},
    evaluation::{
        PredictionRow,
        metrics::{BinaryMetrics, nan_as_null},
        statistics::{ComparisonRow, compare_methods},
    },
    features::{FeatureTable, Split},
    models::{
        ClassWeight, ClassifierSpec, PipelineSpec,
        forest::ForestParams,
        hist_gb::HistGbParams,
        logistic::{LogisticParams, Penalty},
    },
    training::{
        bundle::{ConfigSnapshot, MethodPayload, ModelBundle, TuningRecord, TuningSnapshot},
        trainer::{MethodData, TrainedModel, fit_calibrated, train_method},
    },
};

pub const SELECTION_RULE: &str = "best_val_f1_then_val_auc";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningMode {
    /// Logistic regression only.
    #[default]
    SingleStage,
    /// Every classifier family, plus a best-by-test reference.
    TwoStage,
}

impl fmt::Display for TuningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TuningMode::SingleStage => "single_stage",
            TuningMode::TwoStage => "two_stage",
        })
    }
}

impl FromStr for TuningMode {
    type Err = ForensicsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "single_stage" | "single-stage" => Ok(TuningMode::SingleStage),
            "two_stage" | "two-stage" => Ok(TuningMode::TwoStage),
            other => Err(ForensicsError::InvalidParameter(format!("unknown tuning mode '{other}'"))),
        }
    }
}

/// C x class weight x top-k x penalty over logistic regression.
pub fn single_stage_grid() -> Vec<PipelineSpec> {
    let mut grid = Vec::new();
    for c in [0.3, 1.0, 3.0] {
        for class_weight in [ClassWeight::Balanced, ClassWeight::None] {
            for top_k in [None, Some(30), Some(40)] {
                for penalty in [Penalty::L2, Penalty::L1] {
                    let params = LogisticParams {
                        c,
                        penalty,
                        class_weight,
                        max_iter: 2000,
                        ..LogisticParams::default()
                    };
                    grid.push(PipelineSpec::new(ClassifierSpec::Logistic(params), top_k));
                }
            }
        }
    }
    grid
}

/// Logistic, random forest, extra trees and histogram boosting, all balanced.
pub fn two_stage_grid() -> Vec<PipelineSpec> {
    let top_ks = [None, Some(40)];
    let mut grid = Vec::new();

    for c in [0.2, 0.5, 1.0, 2.0] {
        for penalty in [Penalty::L1, Penalty::L2] {
            for top_k in top_ks {
                let params = LogisticParams {
                    c,
                    penalty,
                    class_weight: ClassWeight::Balanced,
                    max_iter: 4000,
                    ..LogisticParams::default()
                };
                grid.push(PipelineSpec::new(ClassifierSpec::Logistic(params), top_k));
            }
        }
    }

    let forest_grid = || {
        let mut out = Vec::new();
        for n_estimators in [300, 600] {
            for max_depth in [None, Some(24)] {
                for min_samples_leaf in [1, 3] {
                    for top_k in top_ks {
                        let params = ForestParams {
                            n_estimators,
                            max_depth,
                            min_samples_leaf,
                            class_weight: ClassWeight::Balanced,
                            ..ForestParams::default()
                        };
                        out.push((params, top_k));
                    }
                }
            }
        }
        out
    };
    for (params, top_k) in forest_grid() {
        grid.push(PipelineSpec::new(ClassifierSpec::RandomForest(params), top_k));
    }
    for (params, top_k) in forest_grid() {
        grid.push(PipelineSpec::new(ClassifierSpec::ExtraTrees(params), top_k));
    }

    for max_depth in [None, Some(8)] {
        for learning_rate in [0.05, 0.1] {
            for max_leaf_nodes in [31, 63] {
                for top_k in top_ks {
                    let params = HistGbParams {
                        learning_rate,
                        max_iter: 500,
                        max_leaf_nodes,
                        max_depth,
                        class_weight: ClassWeight::Balanced,
                        ..HistGbParams::default()
                    };
                    grid.push(PipelineSpec::new(ClassifierSpec::HistGb(params), top_k));
                }
            }
        }
    }
    grid
}

impl TuningMode {
    pub fn default_grid(&self) -> Vec<PipelineSpec> {
        match self {
            TuningMode::SingleStage => single_stage_grid(),
            TuningMode::TwoStage => two_stage_grid(),
        }
    }
}

/// One successfully evaluated candidate of the sweep table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRow {
    pub model_family: String,
    pub params: String,
    pub top_k: Option<usize>,
    pub threshold: f64,
    pub val_f1: f64,
    pub val_precision: f64,
    pub val_recall: f64,
    #[serde(with = "nan_as_null")]
    pub val_auc: f64,
    pub test_f1: f64,
    pub test_precision: f64,
    pub test_recall: f64,
    #[serde(with = "nan_as_null")]
    pub test_auc: f64,
    pub test_accuracy: f64,
}

impl SweepRow {
    fn new(spec: &PipelineSpec, threshold: f64, val: &BinaryMetrics, test: &BinaryMetrics) -> Self {
        Self {
            model_family: spec.classifier.family().to_string(),
            params: spec.params_json(),
            top_k: spec.top_k,
            threshold,
            val_f1: val.f1,
            val_precision: val.precision,
            val_recall: val.recall,
            val_auc: val.roc_auc,
            test_f1: test.f1,
            test_precision: test.precision,
            test_recall: test.recall,
            test_auc: test.roc_auc,
            test_accuracy: test.accuracy,
        }
    }
}

/// Descending order with NaN sorted after every number.
fn desc_nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.total_cmp(&a),
    }
}

/// Stable sort by validation F1 then validation AUC, both descending.
pub fn sort_sweep(rows: &mut [SweepRow]) {
    rows.sort_by(|a, b| desc_nan_last(a.val_f1, b.val_f1).then_with(|| desc_nan_last(a.val_auc, b.val_auc)));
}

struct Evaluated {
    spec: PipelineSpec,
    model: TrainedModel,
    val: BinaryMetrics,
    test: BinaryMetrics,
}

/// The validation-selected candidate. Only this type converts into a payload.
#[derive(Debug, Clone)]
pub struct SelectedCandidate {
    pub spec: PipelineSpec,
    pub model: TrainedModel,
}

impl SelectedCandidate {
    pub fn val_metrics(&self) -> Option<&BinaryMetrics> {
        self.model.metrics(Split::Val)
    }

    pub fn test_metrics(&self) -> Option<&BinaryMetrics> {
        self.model.metrics(Split::Test)
    }

    pub fn to_payload(&self) -> MethodPayload {
        let mut payload = MethodPayload::from(&self.model);
        payload.split_metrics.retain(|split, _| *split != Split::Train);
        payload.tuning = Some(TuningRecord {
            model_family: self.spec.classifier.family().to_string(),
            spec: self.spec.clone(),
        });
        payload
    }
}

/// Best candidate by test F1. Diagnostic only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceCandidate {
    pub spec: PipelineSpec,
    pub threshold: f64,
    pub val_metrics: BinaryMetrics,
    pub test_metrics: BinaryMetrics,
    #[serde(skip)]
    pub test_predictions: Vec<PredictionRow>,
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub selected: SelectedCandidate,
    pub reference: ReferenceCandidate,
    pub rows: Vec<SweepRow>,
    pub n_candidates: usize,
}

impl SweepOutcome {
    pub fn n_failed(&self) -> usize {
        self.n_candidates - self.rows.len()
    }
}

fn beats_on_validation(candidate: &Evaluated, best: &Evaluated) -> bool {
    candidate.val.f1 > best.val.f1 || (candidate.val.f1 == best.val.f1 && candidate.val.roc_auc > best.val.roc_auc)
}

/// Fits every candidate in parallel and picks the validation winner.
///
/// Failing candidates are logged and left out of the table.
pub fn sweep_candidates(
    data: &MethodData,
    candidates: &[PipelineSpec],
    threshold_config: &ThresholdConfig,
    seed: u64,
) -> Result<SweepOutcome> {
    let evaluated: Vec<Option<Evaluated>> = candidates
        .par_iter()
        .map(|spec| {
            let fitted = fit_calibrated(data, spec, threshold_config, seed).and_then(|model| {
                let val = model.metrics(Split::Val).copied();
                let test = model.metrics(Split::Test).copied();
                match (val, test) {
                    (Some(val), Some(test)) => Ok((model, val, test)),
                    _ => Err(ForensicsError::ModelFit("candidate produced no split metrics".into())),
                }
            });
            match fitted {
                Ok((model, val, test)) => Some(Evaluated {
                    spec: spec.clone(),
                    model,
                    val,
                    test,
                }),
                Err(e) => {
                    log::warn!("Skipping candidate {} top_k={:?}: {}", spec.params_json(), spec.top_k, e);
                    None
                }
            }
        })
        .collect();

    let mut best: Option<&Evaluated> = None;
    let mut best_by_test: Option<&Evaluated> = None;
    let mut rows = Vec::new();
    for candidate in evaluated.iter().flatten() {
        rows.push(SweepRow::new(&candidate.spec, candidate.model.threshold, &candidate.val, &candidate.test));
        if best.is_none_or(|b| beats_on_validation(candidate, b)) {
            best = Some(candidate);
        }
        if best_by_test.is_none_or(|b| candidate.test.f1 > b.test.f1) {
            best_by_test = Some(candidate);
        }
    }

    let (Some(best), Some(best_by_test)) = (best, best_by_test) else {
        return Err(ForensicsError::NoValidCandidate);
    };
    sort_sweep(&mut rows);
    log::info!(
        "Sweep kept {}/{} candidates; best {} val F1 {:.4}",
        rows.len(),
        candidates.len(),
        best.spec.classifier.family(),
        best.val.f1
    );

    Ok(SweepOutcome {
        selected: SelectedCandidate {
            spec: best.spec.clone(),
            model: best.model.clone(),
        },
        reference: ReferenceCandidate {
            spec: best_by_test.spec.clone(),
            threshold: best_by_test.model.threshold,
            val_metrics: best_by_test.val,
            test_metrics: best_by_test.test,
            test_predictions: best_by_test.model.split_predictions(Split::Test).to_vec(),
        },
        rows,
        n_candidates: candidates.len(),
    })
}

/// Headline numbers of a tuning run, written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct TuningSummary {
    pub mode: TuningMode,
    pub baseline_method: String,
    pub primary_method: String,
    pub baseline_test_f1: f64,
    pub tuned_primary_test_f1: f64,
    pub f1_delta_primary_minus_baseline: f64,
    pub baseline_threshold: f64,
    pub tuned_primary_threshold: f64,
    pub best_model_family: String,
    pub best_params: PipelineSpec,
    pub n_candidates: usize,
    pub n_failed: usize,
    pub selection_rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_by_test: Option<ReferenceCandidate>,
}

#[derive(Debug, Clone)]
pub struct TuningOutcome {
    pub mode: TuningMode,
    pub baseline: TrainedModel,
    pub sweep: SweepOutcome,
    pub comparison: ComparisonRow,
    /// Best-by-test candidate against the baseline. Two-stage only.
    pub reference_comparison: Option<ComparisonRow>,
    pub search_space: Vec<PipelineSpec>,
}

impl TuningOutcome {
    pub fn summary(&self) -> TuningSummary {
        let baseline_f1 = self.baseline.metrics(Split::Test).map_or(0.0, |m| m.f1);
        let primary_f1 = self.sweep.selected.test_metrics().map_or(0.0, |m| m.f1);
        TuningSummary {
            mode: self.mode,
            baseline_method: self.baseline.method.clone(),
            primary_method: self.sweep.selected.model.method.clone(),
            baseline_test_f1: baseline_f1,
            tuned_primary_test_f1: primary_f1,
            f1_delta_primary_minus_baseline: primary_f1 - baseline_f1,
            baseline_threshold: self.baseline.threshold,
            tuned_primary_threshold: self.sweep.selected.model.threshold,
            best_model_family: self.sweep.selected.spec.classifier.family().to_string(),
            best_params: self.sweep.selected.spec.clone(),
            n_candidates: self.sweep.n_candidates,
            n_failed: self.sweep.n_failed(),
            selection_rule: SELECTION_RULE.to_string(),
            reference_by_test: (self.mode == TuningMode::TwoStage).then(|| self.sweep.reference.clone()),
        }
    }

    /// Baseline plus the validation-selected primary.
    pub fn to_bundle(&self, config: &LabConfig) -> ModelBundle {
        let mut methods = BTreeMap::new();
        methods.insert(self.baseline.method.clone(), MethodPayload::from(&self.baseline));
        methods.insert(self.sweep.selected.model.method.clone(), self.sweep.selected.to_payload());

        let mut snapshot = ConfigSnapshot::from_config(config);
        snapshot.tuning = Some(TuningSnapshot {
            mode: self.mode,
            search_space: self.search_space.clone(),
            selection_rule: SELECTION_RULE.to_string(),
        });
        ModelBundle::new(Some("tuned"), &self.sweep.selected.model.method, methods, snapshot)
    }
}

/// Trains the baseline, sweeps the primary and compares the two on test.
pub fn tune_primary(table: &FeatureTable, config: &LabConfig, mode: TuningMode) -> Result<TuningOutcome> {
    let baseline_method = &config.experiment.baseline_method;
    let primary_method = &config.experiment.primary_method;

    log::info!("Training baseline {} with the configured classifier", baseline_method);
    let baseline = train_method(baseline_method, table, config)?;

    let search_space = config
        .tuning
        .candidates
        .clone()
        .unwrap_or_else(|| mode.default_grid());
    log::info!("Tuning {} over {} candidates ({})", primary_method, search_space.len(), mode);

    let data = MethodData::from_table(table, primary_method)?;
    let sweep = sweep_candidates(&data, &search_space, &config.tuning.threshold, config.experiment.seed)?;

    let comparison = compare_methods(
        primary_method,
        sweep.selected.model.split_predictions(Split::Test),
        baseline_method,
        baseline.split_predictions(Split::Test),
    )?;
    let reference_comparison = match mode {
        TuningMode::TwoStage => Some(compare_methods(
            primary_method,
            &sweep.reference.test_predictions,
            baseline_method,
            baseline.split_predictions(Split::Test),
        )?),
        TuningMode::SingleStage => None,
    };

    Ok(TuningOutcome {
        mode,
        baseline,
        sweep,
        comparison,
        reference_comparison,
        search_space,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{evaluation::metrics::TargetMetric, training::fixtures::synthetic_table};

    fn row(val_f1: f64, val_auc: f64) -> SweepRow {
        SweepRow {
            model_family: "logistic".into(),
            params: String::new(),
            top_k: None,
            threshold: 0.5,
            val_f1,
            val_precision: 0.0,
            val_recall: 0.0,
            val_auc,
            test_f1: 0.0,
            test_precision: 0.0,
            test_recall: 0.0,
            test_auc: 0.0,
            test_accuracy: 0.0,
        }
    }

    #[test]
    fn grid_sizes_match_search_space() {
        assert_eq!(single_stage_grid().len(), 36);
        let two = two_stage_grid();
        assert_eq!(two.len(), 64);
        assert_eq!(two.iter().filter(|s| s.classifier.family() == "hist_gb").count(), 16);
        assert!(two.iter().all(|s| s.validate().is_ok()));
    }

    #[test]
    fn sweep_sorts_by_val_f1_then_auc_with_nan_last() {
        let mut rows = vec![row(0.7, 0.8), row(f64::NAN, 0.9), row(0.9, 0.6), row(0.9, 0.7), row(0.7, f64::NAN)];
        sort_sweep(&mut rows);
        let keys: Vec<(f64, f64)> = rows.iter().map(|r| (r.val_f1, r.val_auc)).collect();
        assert_eq!(keys[0], (0.9, 0.7));
        assert_eq!(keys[1], (0.9, 0.6));
        assert_eq!(keys[2], (0.7, 0.8));
        assert!(keys[3].1.is_nan());
        assert!(keys[4].0.is_nan());
    }

    #[test]
    fn failing_candidate_is_skipped() {
        let table = synthetic_table();
        let data = MethodData::from_table(&table, "ela_dwt_svd").unwrap();
        let candidates = vec![
            PipelineSpec::default(),
            PipelineSpec::new(ClassifierSpec::default(), Some(50)),
            PipelineSpec::new(ClassifierSpec::default(), Some(2)),
        ];
        let outcome = sweep_candidates(&data, &candidates, &ThresholdConfig::tuning(), 42).unwrap();
        assert_eq!(outcome.n_candidates, 3);
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.n_failed(), 1);
        assert!(outcome.selected.spec.top_k != Some(50));
    }

    #[test]
    fn all_failing_candidates_is_fatal() {
        let table = synthetic_table();
        let data = MethodData::from_table(&table, "ela_only").unwrap();
        let candidates = vec![PipelineSpec::new(ClassifierSpec::default(), Some(9))];
        let err = sweep_candidates(&data, &candidates, &ThresholdConfig::tuning(), 0).unwrap_err();
        assert!(matches!(err, ForensicsError::NoValidCandidate));
    }

    #[test]
    fn selection_ignores_test_metrics() {
        let table = synthetic_table();
        let data = MethodData::from_table(&table, "ela_dwt_svd").unwrap();
        let candidates = single_stage_grid()
            .into_iter()
            .filter(|s| s.top_k.is_none())
            .collect::<Vec<_>>();
        let outcome = sweep_candidates(&data, &candidates, &ThresholdConfig::tuning(), 1).unwrap();

        let best_val = outcome
            .rows
            .iter()
            .map(|r| r.val_f1)
            .fold(f64::NEG_INFINITY, f64::max);
        let selected_val = outcome.selected.val_metrics().unwrap().get(TargetMetric::F1);
        assert_eq!(selected_val, best_val);
        assert_eq!(outcome.rows[0].val_f1, best_val);

        let best_test = outcome
            .rows
            .iter()
            .map(|r| r.test_f1)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.reference.test_metrics.f1, best_test);
    }

    #[test]
    fn tuned_bundle_holds_baseline_and_selected_primary() {
        let table = synthetic_table();
        let mut config = LabConfig::default();
        config.tuning.candidates = Some(vec![
            PipelineSpec::default(),
            PipelineSpec::new(
                ClassifierSpec::Logistic(LogisticParams {
                    c: 0.3,
                    penalty: Penalty::L1,
                    ..LogisticParams::default()
                }),
                None,
            ),
        ]);
        let outcome = tune_primary(&table, &config, TuningMode::TwoStage).unwrap();
        assert_eq!(outcome.comparison.primary_method, "ela_dwt_svd");
        assert_eq!(outcome.comparison.baseline_method, "ela_dwt");
        let reference = outcome.reference_comparison.as_ref().unwrap();
        assert_eq!(reference.baseline_method, "ela_dwt");
        assert_eq!(reference.primary_method, "ela_dwt_svd");
        assert_eq!(outcome.sweep.reference.test_predictions.len(), 12);

        let bundle = outcome.to_bundle(&config);
        assert!(bundle.model_version.contains("-tuned-"));
        assert_eq!(bundle.methods.len(), 2);
        let primary = bundle.primary().unwrap();
        assert!(primary.tuning.is_some());
        assert!(!primary.split_metrics.contains_key(&Split::Train));
        assert!(bundle.method("ela_dwt").unwrap().split_metrics.contains_key(&Split::Train));
        assert_eq!(bundle.config.tuning.as_ref().unwrap().search_space.len(), 2);

        let summary = outcome.summary();
        assert_eq!(summary.n_candidates, 2);
        assert!(summary.reference_by_test.is_some());
        assert_eq!(summary.selection_rule, SELECTION_RULE);
    }

    #[test]
    fn mode_parses_both_spellings() {
        assert_eq!("two-stage".parse::<TuningMode>().unwrap(), TuningMode::TwoStage);
        assert_eq!("single_stage".parse::<TuningMode>().unwrap(), TuningMode::SingleStage);
        assert!("three".parse::<TuningMode>().is_err());
    }
}
