use std::fmt;

use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use crate::error::{ForensicsError, Result};

/// Metric maximized by threshold search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Accuracy,
    Precision,
    Recall,
    F1,
    RocAuc,
}

/// Metrics that can be bootstrapped from hard predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapMetric {
    Accuracy,
    Precision,
    Recall,
    F1,
}

impl BootstrapMetric {
    pub const ALL: [BootstrapMetric; 4] = [
        BootstrapMetric::Accuracy,
        BootstrapMetric::Precision,
        BootstrapMetric::Recall,
        BootstrapMetric::F1,
    ];
}

impl fmt::Display for BootstrapMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootstrapMetric::Accuracy => "accuracy",
            BootstrapMetric::Precision => "precision",
            BootstrapMetric::Recall => "recall",
            BootstrapMetric::F1 => "f1",
        };
        f.write_str(name)
    }
}

/// Serializes non-finite floats as `null` and reads `null` back as NaN.
pub mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_some(value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confusion {
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
    pub tp: u64,
}

impl Confusion {
    pub fn from_predictions(y_true: &[u8], y_pred: &[u8]) -> Self {
        let mut c = Confusion::default();
        for (&t, &p) in y_true.iter().zip(y_pred) {
            match (t, p) {
                (0, 0) => c.tn += 1,
                (0, _) => c.fp += 1,
                (_, 0) => c.fn_ += 1,
                _ => c.tp += 1,
            }
        }
        c
    }

    fn total(&self) -> u64 {
        self.tn + self.fp + self.fn_ + self.tp
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    pub fn metric(&self, metric: BootstrapMetric) -> f64 {
        match metric {
            BootstrapMetric::Accuracy => self.accuracy(),
            BootstrapMetric::Precision => self.precision(),
            BootstrapMetric::Recall => self.recall(),
            BootstrapMetric::F1 => self.f1(),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
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
}

impl BinaryMetrics {
    pub fn get(&self, metric: TargetMetric) -> f64 {
        match metric {
            TargetMetric::Accuracy => self.accuracy,
            TargetMetric::Precision => self.precision,
            TargetMetric::Recall => self.recall,
            TargetMetric::F1 => self.f1,
            TargetMetric::RocAuc => self.roc_auc,
        }
    }
}

pub fn apply_threshold(y_prob: &[f64], threshold: f64) -> Vec<u8> {
    y_prob.iter().map(|&p| u8::from(p >= threshold)).collect()
}

fn check_aligned(y_true: &[u8], y_prob: &[f64]) -> Result<()> {
    if y_true.len() != y_prob.len() {
        return Err(ForensicsError::InvalidParameter(format!(
            "{} labels but {} probabilities",
            y_true.len(),
            y_prob.len()
        )));
    }
    Ok(())
}

/// Threshold metrics at `prob >= threshold`, zero-division mapped to 0.
pub fn compute_binary_metrics(y_true: &[u8], y_prob: &[f64], threshold: f64) -> Result<BinaryMetrics> {
    check_aligned(y_true, y_prob)?;
    let y_pred = apply_threshold(y_prob, threshold);
    let c = Confusion::from_predictions(y_true, &y_pred);

    Ok(BinaryMetrics {
        accuracy: c.accuracy(),
        precision: c.precision(),
        recall: c.recall(),
        f1: c.f1(),
        roc_auc: roc_auc(y_true, y_prob),
        tn: c.tn,
        fp: c.fp,
        fn_: c.fn_,
        tp: c.tp,
        threshold,
    })
}

/// Average ranks (1-based) with ties sharing the mean of their positions.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Area under the ROC curve via the Mann-Whitney statistic; NaN when only
/// one class is present.
pub fn roc_auc(y_true: &[u8], y_prob: &[f64]) -> f64 {
    let n_pos = y_true.iter().filter(|&&y| y == 1).count();
    let n_neg = y_true.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return f64::NAN;
    }
    let ranks = average_ranks(y_prob);
    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(y_true)
        .filter(|(_, y)| **y == 1)
        .map(|(r, _)| r)
        .sum();
    let n_pos = n_pos as f64;
    (pos_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInterval {
    pub metric: BootstrapMetric,
    pub mean: f64,
    pub std: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (pos - lower as f64)
}

/// Percentile bootstrap of a hard-prediction metric with a seeded generator.
pub fn bootstrap_metric_ci(
    y_true: &[u8],
    y_prob: &[f64],
    threshold: f64,
    metric: BootstrapMetric,
    n_bootstrap: usize,
    confidence_level: f64,
    seed: u64,
) -> Result<BootstrapInterval> {
    check_aligned(y_true, y_prob)?;
    if y_true.is_empty() || n_bootstrap == 0 {
        return Err(ForensicsError::InvalidParameter(
            "bootstrap needs at least one sample and one resample".into(),
        ));
    }

    let y_pred = apply_threshold(y_prob, threshold);
    let n = y_true.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scores = Vec::with_capacity(n_bootstrap);
    let mut yt = vec![0u8; n];
    let mut yp = vec![0u8; n];

    for _ in 0..n_bootstrap {
        for k in 0..n {
            let idx = rng.gen_range(0..n);
            yt[k] = y_true[idx];
            yp[k] = y_pred[idx];
        }
        scores.push(Confusion::from_predictions(&yt, &yp).metric(metric));
    }

    let count = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / count;
    let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / count).sqrt();
    scores.sort_by(|a, b| a.total_cmp(b));
    let alpha = (1.0 - confidence_level) / 2.0;

    Ok(BootstrapInterval {
        metric,
        mean,
        std,
        ci_lower: quantile_sorted(&scores, alpha),
        ci_upper: quantile_sorted(&scores, 1.0 - alpha),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn perfect_separation_at_half() {
        let m = compute_binary_metrics(&[0, 0, 1, 1], &[0.1, 0.4, 0.6, 0.9], 0.5).unwrap();
        assert_eq!((m.tp, m.tn, m.fp, m.fn_), (2, 2, 0, 0));
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.f1, 1.0);
        assert_eq!(m.roc_auc, 1.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let m = compute_binary_metrics(&[0, 1], &[0.2, 0.5], 0.5).unwrap();
        assert_eq!(m.tp, 1);
        assert_eq!(m.fp, 0);
    }

    #[test]
    fn single_class_gives_nan_auc_without_failing() {
        let m = compute_binary_metrics(&[1, 1, 1], &[0.2, 0.7, 0.9], 0.5).unwrap();
        assert!(m.roc_auc.is_nan());
        assert_abs_diff_eq!(m.recall, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn no_positive_predictions_give_zero_precision() {
        let m = compute_binary_metrics(&[0, 1], &[0.1, 0.2], 0.5).unwrap();
        assert_eq!(m.precision, 0.0);
        assert_eq!(m.f1, 0.0);
    }

    #[test]
    fn auc_averages_tied_scores() {
        assert_abs_diff_eq!(roc_auc(&[0, 1], &[0.5, 0.5]), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(roc_auc(&[0, 0, 1, 1], &[0.1, 0.8, 0.4, 0.9]), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        assert!(compute_binary_metrics(&[0, 1], &[0.3], 0.5).is_err());
    }

    #[test]
    fn nan_auc_survives_json_round_trip() {
        let m = compute_binary_metrics(&[0, 0], &[0.2, 0.7], 0.5).unwrap();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"roc_auc\":null"));
        assert!(json.contains("\"fn\":0"));
        let back: BinaryMetrics = serde_json::from_str(&json).unwrap();
        assert!(back.roc_auc.is_nan());
    }

    #[test]
    fn bootstrap_is_seeded_and_bounded() {
        let y = [0, 1, 0, 1, 1, 0, 1, 0, 1, 1];
        let p = [0.2, 0.8, 0.6, 0.7, 0.4, 0.1, 0.9, 0.3, 0.55, 0.65];
        let a = bootstrap_metric_ci(&y, &p, 0.5, BootstrapMetric::F1, 200, 0.95, 7).unwrap();
        let b = bootstrap_metric_ci(&y, &p, 0.5, BootstrapMetric::F1, 200, 0.95, 7).unwrap();
        assert_eq!(a, b);
        assert!(a.ci_lower <= a.mean && a.mean <= a.ci_upper);
        assert!(a.ci_upper <= 1.0 && a.ci_lower >= 0.0);
    }

    #[test]
    fn bootstrap_of_constant_metric_has_zero_spread() {
        let y = [0, 1, 0, 1];
        let p = [0.1, 0.9, 0.2, 0.8];
        let ci = bootstrap_metric_ci(&y, &p, 0.5, BootstrapMetric::Accuracy, 50, 0.9, 1).unwrap();
        assert_eq!(ci.mean, 1.0);
        assert_eq!(ci.std, 0.0);
        assert_eq!((ci.ci_lower, ci.ci_upper), (1.0, 1.0));
    }
}
