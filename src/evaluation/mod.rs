//! Evaluation of trained methods: threshold metrics, paired statistics,
//! robustness under perturbation, localization and error analysis.

pub mod error_analysis;
pub mod hypothesis;
pub mod localization;
pub mod metrics;
pub mod perturb;
pub mod robustness;
pub mod statistics;

use serde::{Deserialize, Serialize};

use metrics::{BinaryMetrics, BootstrapInterval, BootstrapMetric, nan_as_null};

/// One scored image of one split for one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub image_path: String,
    pub label: u8,
    pub probability: f64,
    pub prediction: u8,
}

impl PredictionRow {
    pub fn new(image_path: impl Into<String>, label: u8, probability: f64, threshold: f64) -> Self {
        Self {
            image_path: image_path.into(),
            label,
            probability,
            prediction: u8::from(probability >= threshold),
        }
    }

    pub fn is_correct(&self) -> bool {
        self.prediction == self.label
    }
}

pub fn labels_and_probabilities(rows: &[PredictionRow]) -> (Vec<u8>, Vec<f64>) {
    rows.iter().map(|r| (r.label, r.probability)).unzip()
}

/// Test-split metrics of one method, one row of the main summary table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSummaryRow {
    pub method: String,
    pub threshold: f64,
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
}

impl MethodSummaryRow {
    pub fn new(method: &str, metrics: &BinaryMetrics) -> Self {
        Self {
            method: method.to_string(),
            threshold: metrics.threshold,
            accuracy: metrics.accuracy,
            precision: metrics.precision,
            recall: metrics.recall,
            f1: metrics.f1,
            roc_auc: metrics.roc_auc,
            tn: metrics.tn,
            fp: metrics.fp,
            fn_: metrics.fn_,
            tp: metrics.tp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapRow {
    pub method: String,
    pub metric: BootstrapMetric,
    pub mean: f64,
    pub std: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

impl BootstrapRow {
    pub fn new(method: &str, interval: &BootstrapInterval) -> Self {
        Self {
            method: method.to_string(),
            metric: interval.metric,
            mean: interval.mean,
            std: interval.std,
            ci_lower: interval.ci_lower,
            ci_upper: interval.ci_upper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_uses_inclusive_threshold() {
        let row = PredictionRow::new("a.png", 1, 0.5, 0.5);
        assert_eq!(row.prediction, 1);
        assert!(row.is_correct());
        assert!(!PredictionRow::new("b.png", 1, 0.49, 0.5).is_correct());
    }

    #[test]
    fn labels_and_probabilities_keep_row_order() {
        let rows = vec![
            PredictionRow::new("a.png", 0, 0.2, 0.5),
            PredictionRow::new("b.png", 1, 0.9, 0.5),
        ];
        let (y, p) = labels_and_probabilities(&rows);
        assert_eq!(y, vec![0, 1]);
        assert_eq!(p, vec![0.2, 0.9]);
    }

    #[test]
    fn summary_row_copies_test_metrics() {
        let metrics = metrics::compute_binary_metrics(&[0, 1, 1], &[0.2, 0.7, 0.4], 0.5).unwrap();
        let row = MethodSummaryRow::new("ela_only", &metrics);
        assert_eq!(row.threshold, 0.5);
        assert_eq!((row.tp, row.fn_, row.tn, row.fp), (1, 1, 1, 0));
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["fn"], 1);
    }
}
