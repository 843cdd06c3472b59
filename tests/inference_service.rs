mod common;

use std::io::Cursor;

use forensic_fusion::{
    pipeline::run_pipeline,
    serve::{InferRequest, InferenceEngine, InferenceService, PredictionLabel, ServiceResponse},
};
use image::{DynamicImage, ImageFormat};

fn png(seed: u64, manipulated: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(common::synthetic_image(seed, manipulated))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[test]
fn trained_bundle_serves_requests() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let manifest = common::write_dataset(dir.path(), 32);
    let config = common::small_config(dir.path(), &manifest);
    let run = run_pipeline(&config).unwrap();

    let service = InferenceService::new();
    assert!(!service.health().ready);
    service.load(&run.bundle_path).unwrap();

    let health = service.health();
    assert!(health.ready);
    assert_eq!(health.model_version.as_deref(), Some(run.model_version.as_str()));

    let response = service.handle_infer(&InferRequest {
        file_bytes: png(101, true),
        filename: Some("upload.png".into()),
        content_type: Some("image/png".into()),
        return_heatmap: true,
    });
    assert_eq!(response.status(), 200);
    let ServiceResponse::Success(body) = response else {
        panic!("expected a successful response");
    };
    let p = body.prediction.probability;
    assert!((0.0..=1.0).contains(&p));
    assert_eq!(p, body.scores.fusion_score);
    let threshold = InferenceEngine::load(&run.bundle_path)
        .unwrap()
        .bundle()
        .primary()
        .map(|payload| payload.threshold)
        .unwrap();
    let expected = if p >= threshold {
        PredictionLabel::Manipulated
    } else {
        PredictionLabel::Authentic
    };
    assert_eq!(body.prediction.label, expected);
    assert!(!body.explainability.top_signals.is_empty());
    assert!(body.explainability.top_signals.len() <= 3);
    assert!(body.explainability.ela_heatmap_base64.is_some());
}

#[test]
fn json_contract_uses_camel_case() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = common::write_dataset(dir.path(), 32);
    let config = common::small_config(dir.path(), &manifest);
    let run = run_pipeline(&config).unwrap();

    let engine = InferenceEngine::load(&run.bundle_path).unwrap();
    let response = engine.infer(&png(7, false), "clean.png", false).unwrap();
    let json = serde_json::to_value(&response).unwrap();
    for key in ["ok", "modelVersion", "filename", "prediction", "scores", "explainability", "timingMs"] {
        assert!(json.get(key).is_some(), "missing {key}");
    }
    for key in ["elaScore", "dwtsvdScore", "cfaScore", "prnuScore", "mantraScore", "fusionScore"] {
        assert!(json["scores"][key].is_number(), "missing score {key}");
    }
    assert!(json["explainability"]["cfaMapBase64"].is_null());
}

#[test]
fn missing_bundle_leaves_service_unready() {
    let dir = tempfile::tempdir().unwrap();
    let service = InferenceService::new();
    assert!(service.load(dir.path().join("nope.json")).is_err());
    let response = service.handle_infer(&InferRequest::default());
    assert_eq!(response.status(), 503);
}
