use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use serde::{Deserialize, Serialize};

use crate::{
    ForensicsAnalyzer,
    analysis::Features,
    error::Result,
    image_utils,
    training::{MethodPayload, ModelBundle},
};

const TOP_SIGNALS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionLabel {
    Authentic,
    Manipulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    pub label: PredictionLabel,
    pub probability: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub ela_score: f64,
    #[serde(rename = "dwtsvdScore")]
    pub dwt_svd_score: f64,
    pub cfa_score: f64,
    pub prnu_score: f64,
    pub mantra_score: f64,
    pub fusion_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explainability {
    pub top_signals: Vec<String>,
    pub ela_heatmap_base64: Option<String>,
    pub cfa_map_base64: Option<String>,
    pub mantra_mask_base64: Option<String>,
    pub prnu_residual_base64: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub ok: bool,
    pub model_version: String,
    pub filename: String,
    pub prediction: PredictionSummary,
    pub scores: ScoreBreakdown,
    pub explainability: Explainability,
    pub timing_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Scores single images with a loaded bundle.
///
/// Sub-method scores come from the bundle's method models when present and
/// fall back to each signal's fixed-weight score otherwise. Without a primary
/// payload the fusion score is the heuristic blend at threshold 0.5.
#[derive(Debug, Clone)]
pub struct InferenceEngine {
    bundle_path: PathBuf,
    bundle: ModelBundle,
    analyzer: ForensicsAnalyzer,
}

impl InferenceEngine {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bundle = ModelBundle::load(path.as_ref())?;
        log::info!("Inference engine ready with {}", bundle.model_version);
        Ok(Self::from_bundle(bundle, path.as_ref()))
    }

    pub fn from_bundle(bundle: ModelBundle, bundle_path: impl Into<PathBuf>) -> Self {
        let analyzer = ForensicsAnalyzer::with_config(bundle.config.features.clone());
        Self {
            bundle_path: bundle_path.into(),
            bundle,
            analyzer,
        }
    }

    pub fn model_version(&self) -> &str {
        &self.bundle.model_version
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    /// `None` when the method is absent or one of its columns was not extracted.
    fn method_probability(&self, method: &str, features: &Features) -> Result<Option<f64>> {
        let Some(payload) = self.bundle.method(method) else {
            return Ok(None);
        };
        if payload.feature_columns.iter().any(|c| features.get(c).is_none()) {
            return Ok(None);
        }
        payload.predict_features(features).map(Some)
    }

    fn top_signals(&self, primary: Option<&MethodPayload>, features: &Features) -> Result<Vec<String>> {
        match primary {
            Some(payload) => {
                let row: Vec<f64> = features
                    .select(&payload.feature_columns)?
                    .into_iter()
                    .map(|v| v as f32 as f64)
                    .collect();
                payload.pipeline.top_features(&row, &payload.feature_columns, TOP_SIGNALS)
            }
            None => Ok(features.largest_magnitude(TOP_SIGNALS)),
        }
    }

    pub fn infer(&self, bytes: &[u8], filename: &str, return_heatmap: bool) -> Result<InferenceResponse> {
        let started = Instant::now();
        let image = image_utils::decode_image_bytes(bytes, self.bundle.config.experiment.image_size)?;
        let report = self.analyzer.full_analysis(&image, return_heatmap)?;
        let features = report.features();
        let simple = report.simple_scores();

        let score_or = |method: &str, fallback: f64| -> Result<f64> {
            Ok(self.method_probability(method, &features)?.unwrap_or(fallback))
        };

        let primary = self
            .bundle
            .primary()
            .filter(|p| p.feature_columns.iter().all(|c| features.get(c).is_some()));
        let fusion = score_or(&self.bundle.primary_method, simple.heuristic_fusion())?;
        let threshold = self.bundle.primary().map_or(0.5, |p| p.threshold);
        let label = if fusion >= threshold {
            PredictionLabel::Manipulated
        } else {
            PredictionLabel::Authentic
        };

        let scores = ScoreBreakdown {
            ela_score: round_to(score_or("ela_only", simple.ela)?, 6),
            dwt_svd_score: round_to(score_or("dwt_svd_only", simple.dwt_svd)?, 6),
            cfa_score: round_to(score_or("cfa_only", simple.cfa)?, 6),
            prnu_score: round_to(score_or("prnu_only", simple.prnu)?, 6),
            mantra_score: round_to(score_or("mantra_only", simple.mantra)?, 6),
            fusion_score: round_to(fusion, 6),
        };

        let maps = |png: &Option<String>| if return_heatmap { png.clone() } else { None };
        let explainability = Explainability {
            top_signals: self.top_signals(primary, &features)?,
            ela_heatmap_base64: maps(&report.ela.png_base64),
            cfa_map_base64: maps(&report.cfa.png_base64),
            mantra_mask_base64: maps(&report.mantra.png_base64),
            prnu_residual_base64: maps(&report.prnu.png_base64),
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        log::debug!("Inferred {} as {:?} (p={:.4}) in {:.1} ms", filename, label, fusion, elapsed_ms);

        Ok(InferenceResponse {
            ok: true,
            model_version: self.bundle.model_version.clone(),
            filename: filename.to_string(),
            prediction: PredictionSummary {
                label,
                probability: round_to(fusion, 6),
                confidence: round_to((fusion - 0.5).abs() * 2.0, 6),
            },
            scores,
            explainability,
            timing_ms: round_to(elapsed_ms, 3),
            request_id: None,
            content_type: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serve::fixtures::{bundle_with_primary, empty_bundle, png_bytes, test_image};

    #[test]
    fn empty_bundle_uses_heuristic_fusion() {
        let bundle = empty_bundle();
        let engine = InferenceEngine::from_bundle(bundle, "memory");
        let response = engine.infer(&png_bytes(3), "a.png", false).unwrap();

        let report = ForensicsAnalyzer::with_config(engine.bundle().config.features.clone())
            .full_analysis(&test_image(3), false)
            .unwrap();
        let expected = round_to(report.simple_scores().heuristic_fusion(), 6);
        assert_eq!(response.scores.fusion_score, expected);
        assert_eq!(response.prediction.probability, expected);
        assert_eq!(response.scores.ela_score, round_to(report.simple_scores().ela, 6));
        let expected_label = if expected >= 0.5 {
            PredictionLabel::Manipulated
        } else {
            PredictionLabel::Authentic
        };
        assert_eq!(response.prediction.label, expected_label);
        assert_eq!(response.explainability.top_signals, report.features().largest_magnitude(3));
        assert!(response.explainability.ela_heatmap_base64.is_none());
    }

    #[test]
    fn primary_model_drives_fusion_and_explanations() {
        let engine = InferenceEngine::from_bundle(bundle_with_primary("ela_only"), "memory");
        let response = engine.infer(&png_bytes(5), "b.png", false).unwrap();
        assert_eq!(response.scores.fusion_score, response.scores.ela_score);
        let p = response.prediction.probability;
        assert!((0.0..=1.0).contains(&p));
        assert!((response.prediction.confidence - round_to((p - 0.5).abs() * 2.0, 6)).abs() < 1e-6);
        assert_eq!(response.explainability.top_signals.len(), 3);
        assert!(response.explainability.top_signals.iter().all(|s| s.starts_with("ela_")));
    }

    #[test]
    fn heatmaps_only_when_requested() {
        let engine = InferenceEngine::from_bundle(empty_bundle(), "memory");
        let response = engine.infer(&png_bytes(1), "c.png", true).unwrap();
        let e = &response.explainability;
        assert!(e.ela_heatmap_base64.is_some());
        assert!(e.cfa_map_base64.is_some());
        assert!(e.mantra_mask_base64.is_some());
        assert!(e.prnu_residual_base64.is_some());
    }

    #[test]
    fn response_uses_camel_case_contract() {
        let engine = InferenceEngine::from_bundle(empty_bundle(), "memory");
        let json = serde_json::to_value(engine.infer(&png_bytes(2), "d.png", false).unwrap()).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json["modelVersion"].is_string());
        assert!(json["scores"]["dwtsvdScore"].is_number());
        assert!(json["explainability"]["elaHeatmapBase64"].is_null());
        assert!(json["timingMs"].is_number());
        assert!(json.get("requestId").is_none());
    }

    #[test]
    fn undecodable_upload_is_an_error() {
        let engine = InferenceEngine::from_bundle(empty_bundle(), "memory");
        assert!(engine.infer(b"not an image", "x.bin", false).is_err());
    }
}
