use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    ForensicsAnalyzer,
    analysis::Features,
    config::{FeatureConfig, LabConfig},
    error::Result,
    evaluation::{
        metrics::{BinaryMetrics, compute_binary_metrics, nan_as_null},
        perturb::Scenario,
    },
    features::FeatureRow,
    image_utils,
};

/// A fitted method the suite can re-score: freshly trained or loaded from a bundle.
pub trait MethodScorer {
    /// Decision threshold frozen on validation.
    fn threshold(&self) -> f64;

    /// Test F1 on unperturbed images, 0 when unknown.
    fn clean_test_f1(&self) -> f64;

    fn score_features(&self, features: &Features) -> Result<f64>;
}

/// Metrics of one method under one scenario, next to its clean test F1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessRow {
    pub scenario: String,
    pub method: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    #[serde(with = "nan_as_null")]
    pub roc_auc: f64,
    pub tn: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tp: u64,
    pub threshold: f64,
    pub clean_f1: f64,
    pub relative_drop_f1_pct: f64,
}

impl RobustnessRow {
    fn new(scenario: &str, method: &str, metrics: &BinaryMetrics, clean_f1: f64) -> Self {
        Self {
            scenario: scenario.to_string(),
            method: method.to_string(),
            accuracy: metrics.accuracy,
            precision: metrics.precision,
            recall: metrics.recall,
            f1: metrics.f1,
            roc_auc: metrics.roc_auc,
            tn: metrics.tn,
            fp: metrics.fp,
            fn_: metrics.fn_,
            tp: metrics.tp,
            threshold: metrics.threshold,
            clean_f1,
            relative_drop_f1_pct: relative_f1_drop(clean_f1, metrics.f1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioPrediction {
    pub image_path: String,
    pub label: u8,
    pub probability: f64,
    pub prediction: u8,
    pub scenario: String,
    pub method: String,
}

#[derive(Debug, Clone, Default)]
pub struct RobustnessOutcome {
    pub rows: Vec<RobustnessRow>,
    /// Keyed by `"{scenario}::{method}"`.
    pub predictions: BTreeMap<String, Vec<ScenarioPrediction>>,
}

impl RobustnessOutcome {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Percentage F1 lost relative to the clean test F1; 0 when clean F1 is ~0.
pub fn relative_f1_drop(clean_f1: f64, perturbed_f1: f64) -> f64 {
    if clean_f1 <= 1e-12 {
        return 0.0;
    }
    (clean_f1 - perturbed_f1) / clean_f1 * 100.0
}

/// Per-method roll-up of the scenario rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessSummaryRow {
    pub method: String,
    pub clean_f1: f64,
    #[serde(with = "nan_as_null")]
    pub avg_robust_f1: f64,
    #[serde(with = "nan_as_null")]
    pub avg_relative_drop_f1_pct: f64,
    pub worst_scenario: Option<String>,
    pub worst_f1: Option<f64>,
}

/// One row per method in `clean_f1`, sorted by clean F1 descending.
///
/// Methods without any scenario row get NaN averages and no worst scenario.
pub fn summarize_robustness(rows: &[RobustnessRow], clean_f1: &BTreeMap<String, f64>) -> Vec<RobustnessSummaryRow> {
    let mut summary: Vec<RobustnessSummaryRow> = clean_f1
        .iter()
        .map(|(method, &clean)| {
            let method_rows: Vec<&RobustnessRow> = rows.iter().filter(|r| &r.method == method).collect();
            let n = method_rows.len() as f64;
            let (avg_f1, avg_drop) = if method_rows.is_empty() {
                (f64::NAN, f64::NAN)
            } else {
                (
                    method_rows.iter().map(|r| r.f1).sum::<f64>() / n,
                    method_rows.iter().map(|r| r.relative_drop_f1_pct).sum::<f64>() / n,
                )
            };
            // First minimum wins, so ties keep scenario order.
            let worst = method_rows
                .iter()
                .copied()
                .reduce(|worst, r| if r.f1 < worst.f1 { r } else { worst });
            RobustnessSummaryRow {
                method: method.clone(),
                clean_f1: clean,
                avg_robust_f1: avg_f1,
                avg_relative_drop_f1_pct: avg_drop,
                worst_scenario: worst.map(|r| r.scenario.clone()),
                worst_f1: worst.map(|r| r.f1),
            }
        })
        .collect();
    summary.sort_by(|a, b| b.clean_f1.total_cmp(&a.clean_f1));
    summary
}

/// Re-scores every trained method on perturbed copies of the test images.
///
/// Returns an empty outcome when the suite is disabled in `config`.
pub fn run_robustness_suite<M: MethodScorer + Sync>(
    test_rows: &[FeatureRow],
    models: &BTreeMap<String, M>,
    config: &LabConfig,
) -> Result<RobustnessOutcome> {
    if !config.robustness.enabled {
        log::info!("Robustness suite disabled");
        return Ok(RobustnessOutcome::default());
    }
    run_scenarios(
        test_rows,
        models,
        &config.robustness.scenarios,
        &config.features,
        config.experiment.image_size,
        config.experiment.seed,
    )
}

/// Runs `scenarios` regardless of any enable flag.
///
/// Thresholds and feature columns are the ones frozen at training time.
/// Images that fail to load, perturb or extract are skipped with a warning.
/// Image `i` of the test split is perturbed with seed `base_seed + i`.
pub fn run_scenarios<M: MethodScorer + Sync>(
    test_rows: &[FeatureRow],
    models: &BTreeMap<String, M>,
    scenarios: &[Scenario],
    features: &FeatureConfig,
    image_size: [u32; 2],
    base_seed: u64,
) -> Result<RobustnessOutcome> {
    let analyzer = ForensicsAnalyzer::with_config(features.clone());
    let mut outcome = RobustnessOutcome::default();

    for scenario in scenarios {
        log::info!("Running robustness scenario: {}", scenario.name);

        let scored: Vec<Option<(usize, Vec<f64>)>> = test_rows
            .par_iter()
            .enumerate()
            .map(|(idx, row)| {
                let seed = base_seed.wrapping_add(idx as u64);
                match perturbed_features(&analyzer, scenario, row, image_size, seed) {
                    Ok(features) => models
                        .values()
                        .map(|model| model.score_features(&features))
                        .collect::<Result<Vec<f64>>>()
                        .map(|probs| Some((idx, probs))),
                    Err(e) => {
                        log::warn!("Skipping {} under {}: {}", row.image_path, scenario.name, e);
                        Ok(None)
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let scored: Vec<(usize, Vec<f64>)> = scored.into_iter().flatten().collect();

        if scored.is_empty() {
            log::warn!("No test image survived scenario {}", scenario.name);
            continue;
        }

        for (method_idx, (method, model)) in models.iter().enumerate() {
            let predictions: Vec<ScenarioPrediction> = scored
                .iter()
                .map(|(idx, probs)| {
                    let row = &test_rows[*idx];
                    let probability = probs[method_idx];
                    ScenarioPrediction {
                        image_path: row.image_path.clone(),
                        label: row.label,
                        probability,
                        prediction: u8::from(probability >= model.threshold()),
                        scenario: scenario.name.clone(),
                        method: method.clone(),
                    }
                })
                .collect();

            let y_true: Vec<u8> = predictions.iter().map(|p| p.label).collect();
            let y_prob: Vec<f64> = predictions.iter().map(|p| p.probability).collect();
            let metrics = compute_binary_metrics(&y_true, &y_prob, model.threshold())?;

            outcome
                .rows
                .push(RobustnessRow::new(&scenario.name, method, &metrics, model.clean_test_f1()));
            outcome
                .predictions
                .insert(format!("{}::{}", scenario.name, method), predictions);
        }
    }

    Ok(outcome)
}

fn perturbed_features(
    analyzer: &ForensicsAnalyzer,
    scenario: &Scenario,
    row: &FeatureRow,
    image_size: [u32; 2],
    seed: u64,
) -> Result<Features> {
    let image = image_utils::load_rgb_image(&row.image_path, image_size)?;
    let perturbed = scenario.apply(&image, seed)?;
    Ok(analyzer.full_analysis(&perturbed, false)?.features())
}
