use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    evaluation::{
        PredictionRow,
        hypothesis::{self, TestOutcome},
        metrics::nan_as_null,
    },
};

const NORMALITY_ALPHA: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestName {
    WilcoxonSignedRank,
    PairedTTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectSizeName {
    RankBiserial,
    CohenDPaired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub primary_method: String,
    pub baseline_method: String,
    /// NaN when fewer than three pairs are available.
    #[serde(with = "nan_as_null")]
    pub normality_shapiro_p: f64,
    pub test_name: TestName,
    #[serde(with = "nan_as_null")]
    pub test_statistic: f64,
    pub p_value: f64,
    pub effect_size_name: EffectSizeName,
    pub effect_size: f64,
    pub mean_primary_acc: f64,
    pub mean_baseline_acc: f64,
}

fn sorted_by_path(rows: &[PredictionRow]) -> Vec<&PredictionRow> {
    let mut sorted: Vec<&PredictionRow> = rows.iter().collect();
    sorted.sort_by(|a, b| a.image_path.cmp(&b.image_path));
    sorted
}

fn correctness(rows: &[&PredictionRow]) -> Vec<f64> {
    rows.iter().map(|r| if r.is_correct() { 1.0 } else { 0.0 }).collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// (positives - negatives) / nonzero count of the difference vector.
pub fn rank_biserial(differences: &[f64]) -> f64 {
    let positive = differences.iter().filter(|&&d| d > 0.0).count() as f64;
    let negative = differences.iter().filter(|&&d| d < 0.0).count() as f64;
    if positive + negative == 0.0 {
        return 0.0;
    }
    (positive - negative) / (positive + negative)
}

pub fn cohen_d_paired(differences: &[f64]) -> f64 {
    let sd = hypothesis::sample_std(differences);
    if sd < 1e-12 {
        return 0.0;
    }
    mean(differences) / sd
}

/// Paired comparison of per-image correctness between two methods.
pub fn compare_methods(
    primary_method: &str,
    primary: &[PredictionRow],
    baseline_method: &str,
    baseline: &[PredictionRow],
) -> Result<ComparisonRow> {
    let primary_sorted = sorted_by_path(primary);
    let baseline_sorted = sorted_by_path(baseline);
    let aligned = primary_sorted.len() == baseline_sorted.len()
        && primary_sorted
            .iter()
            .zip(&baseline_sorted)
            .all(|(a, b)| a.image_path == b.image_path);
    if !aligned {
        return Err(ForensicsError::MisalignedPredictions(baseline_method.to_string()));
    }

    let primary_acc = correctness(&primary_sorted);
    let baseline_acc = correctness(&baseline_sorted);
    let diff: Vec<f64> = primary_acc
        .iter()
        .zip(&baseline_acc)
        .map(|(p, b)| p - b)
        .collect();

    let normality_p = if diff.len() >= 3 {
        hypothesis::shapiro_wilk(&diff)?.p_value
    } else {
        f64::NAN
    };

    let (test_name, outcome, effect_size_name, effect_size) =
        if normality_p.is_nan() || normality_p < NORMALITY_ALPHA {
            (
                TestName::WilcoxonSignedRank,
                hypothesis::wilcoxon_signed_rank(&diff)?,
                EffectSizeName::RankBiserial,
                rank_biserial(&diff),
            )
        } else {
            (
                TestName::PairedTTest,
                hypothesis::paired_t_test(&diff)?,
                EffectSizeName::CohenDPaired,
                cohen_d_paired(&diff),
            )
        };
    let TestOutcome { statistic, p_value } = outcome;

    log::debug!(
        "{} vs {}: {:?} statistic={:.4} p={:.4}",
        primary_method,
        baseline_method,
        test_name,
        statistic,
        p_value
    );

    Ok(ComparisonRow {
        primary_method: primary_method.to_string(),
        baseline_method: baseline_method.to_string(),
        normality_shapiro_p: normality_p,
        test_name,
        test_statistic: statistic,
        p_value,
        effect_size_name,
        effect_size,
        mean_primary_acc: mean(&primary_acc),
        mean_baseline_acc: mean(&baseline_acc),
    })
}

/// Compares the primary method against every other method.
pub fn run_method_comparison_stats(
    predictions_by_method: &BTreeMap<String, Vec<PredictionRow>>,
    primary_method: &str,
) -> Result<Vec<ComparisonRow>> {
    let primary = predictions_by_method
        .get(primary_method)
        .ok_or_else(|| ForensicsError::MissingPrimary(primary_method.to_string()))?;

    predictions_by_method
        .iter()
        .filter(|(method, _)| method.as_str() != primary_method)
        .map(|(method, rows)| compare_methods(primary_method, primary, method, rows))
        .collect()
}
