use serde::{Deserialize, Serialize};

use crate::evaluation::PredictionRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    FalsePositive,
    FalseNegative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRow {
    pub image_path: String,
    pub label: u8,
    pub probability: f64,
    pub prediction: u8,
    pub error_type: ErrorType,
    pub confidence_distance: f64,
}

/// The `top_k` most confident mistakes, ranked by `|p - 0.5|` descending.
///
/// Ties keep false positives ahead of false negatives, then input order.
pub fn build_error_analysis_table(predictions: &[PredictionRow], top_k: usize) -> Vec<ErrorRow> {
    let tagged = |error_type: ErrorType| {
        move |row: &PredictionRow| ErrorRow {
            image_path: row.image_path.clone(),
            label: row.label,
            probability: row.probability,
            prediction: row.prediction,
            error_type,
            confidence_distance: (row.probability - 0.5).abs(),
        }
    };

    let mut errors: Vec<ErrorRow> = predictions
        .iter()
        .filter(|r| r.label == 0 && r.prediction == 1)
        .map(tagged(ErrorType::FalsePositive))
        .chain(
            predictions
                .iter()
                .filter(|r| r.label == 1 && r.prediction == 0)
                .map(tagged(ErrorType::FalseNegative)),
        )
        .collect();

    errors.sort_by(|a, b| b.confidence_distance.total_cmp(&a.confidence_distance));
    errors.truncate(top_k);
    errors
}
