//! Persisted model bundle.
//!
//! A bundle is written once at the end of a training or tuning run and only
//! read afterwards. It carries fitted pipelines as tagged JSON, never live
//! configuration objects, so it loads without any training-time state.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    analysis::Features,
    config::{ExperimentConfig, FeatureConfig, LabConfig, ModelConfig},
    error::{ForensicsError, Result},
    evaluation::{MethodSummaryRow, metrics::BinaryMetrics, robustness::MethodScorer},
    features::Split,
    models::{Pipeline, PipelineSpec},
    training::{TrainedModel, trainer::predict_with_columns, tuner::TuningMode},
};

/// Hyperparameters of a tuned payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRecord {
    pub model_family: String,
    pub spec: PipelineSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodPayload {
    pub pipeline: Pipeline,
    pub threshold: f64,
    pub feature_columns: Vec<String>,
    pub split_metrics: BTreeMap<Split, BinaryMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning: Option<TuningRecord>,
}

impl MethodPayload {
    pub fn predict_features(&self, features: &Features) -> Result<f64> {
        predict_with_columns(&self.pipeline, &self.feature_columns, features)
    }

    fn validate(&self, method: &str) -> Result<()> {
        if self.pipeline.n_features() != self.feature_columns.len() {
            return Err(ForensicsError::FeatureMismatch {
                path: method.to_string(),
                detail: format!(
                    "pipeline expects {} features but {} columns are stored",
                    self.pipeline.n_features(),
                    self.feature_columns.len()
                ),
            });
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(ForensicsError::InvalidConfig(format!(
                "threshold {} of method '{}' is outside (0, 1)",
                self.threshold, method
            )));
        }
        Ok(())
    }
}

impl MethodScorer for MethodPayload {
    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn clean_test_f1(&self) -> f64 {
        self.split_metrics.get(&Split::Test).map_or(0.0, |m| m.f1)
    }

    fn score_features(&self, features: &Features) -> Result<f64> {
        self.predict_features(features)
    }
}

impl From<&TrainedModel> for MethodPayload {
    fn from(model: &TrainedModel) -> Self {
        Self {
            pipeline: model.pipeline.clone(),
            threshold: model.threshold,
            feature_columns: model.feature_columns.clone(),
            split_metrics: model.split_metrics.clone(),
            tuning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningSnapshot {
    pub mode: TuningMode,
    pub search_space: Vec<PipelineSpec>,
    pub selection_rule: String,
}

/// Configuration frozen at bundle creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub experiment: ExperimentConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tuning: Option<TuningSnapshot>,
}

impl ConfigSnapshot {
    pub fn from_config(config: &LabConfig) -> Self {
        Self {
            experiment: config.experiment.clone(),
            features: config.features.clone(),
            model: config.model.clone(),
            tuning: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub model_version: String,
    pub created_at: DateTime<Utc>,
    pub primary_method: String,
    pub methods: BTreeMap<String, MethodPayload>,
    pub config: ConfigSnapshot,
    #[serde(default)]
    pub summary_metrics: Vec<MethodSummaryRow>,
}

impl ModelBundle {
    /// Stamps the version as `<name>[-<tag>]-<UTC timestamp>`.
    pub fn new(
        tag: Option<&str>,
        primary_method: &str,
        methods: BTreeMap<String, MethodPayload>,
        config: ConfigSnapshot,
    ) -> Self {
        let created_at = Utc::now();
        let stamp = created_at.format("%Y%m%dT%H%M%SZ");
        let model_version = match tag {
            Some(tag) => format!("{}-{}-{}", config.experiment.name, tag, stamp),
            None => format!("{}-{}", config.experiment.name, stamp),
        };
        Self {
            model_version,
            created_at,
            primary_method: primary_method.to_string(),
            methods,
            config,
            summary_metrics: Vec::new(),
        }
    }

    pub fn from_models(
        models: &BTreeMap<String, TrainedModel>,
        config: &LabConfig,
        summary_metrics: Vec<MethodSummaryRow>,
    ) -> Self {
        let methods = models
            .iter()
            .map(|(name, model)| (name.clone(), MethodPayload::from(model)))
            .collect();
        let mut bundle = Self::new(
            None,
            &config.experiment.primary_method,
            methods,
            ConfigSnapshot::from_config(config),
        );
        bundle.summary_metrics = summary_metrics;
        bundle
    }

    pub fn method(&self, name: &str) -> Option<&MethodPayload> {
        self.methods.get(name)
    }

    pub fn primary(&self) -> Option<&MethodPayload> {
        self.method(&self.primary_method)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        log::info!("Saved model bundle {} to {}", self.model_version, path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bundle: ModelBundle = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        for (name, payload) in &bundle.methods {
            payload.validate(name)?;
        }
        if bundle.primary().is_none() {
            log::warn!(
                "Bundle {} has no payload for primary method {}",
                bundle.model_version,
                bundle.primary_method
            );
        }
        log::debug!("Loaded bundle {} with {} methods", bundle.model_version, bundle.methods.len());
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::{fixtures::synthetic_table, train_method};

    #[test]
    fn bundle_round_trips_through_json() {
        let table = synthetic_table();
        let config = LabConfig::default();
        let model = train_method("ela_dwt", &table, &config).unwrap();
        let mut models = BTreeMap::new();
        models.insert("ela_dwt".to_string(), model.clone());

        let mut config = config;
        config.experiment.primary_method = "ela_dwt".into();
        let bundle = ModelBundle::from_models(&models, &config, Vec::new());
        assert!(bundle.model_version.starts_with("forensic-fusion-"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models/bundle.json");
        bundle.save(&path).unwrap();
        let loaded = ModelBundle::load(&path).unwrap();

        assert_eq!(loaded.model_version, bundle.model_version);
        assert_eq!(loaded.created_at, bundle.created_at);
        let payload = loaded.primary().unwrap();
        assert_eq!(payload.feature_columns, model.feature_columns);
        assert_eq!(payload.threshold, model.threshold);
        assert_eq!(payload.split_metrics[&Split::Test].tp, model.metrics(Split::Test).unwrap().tp);

        let row = &table.rows()[1];
        let mut features = Features::new();
        for (name, value) in table.columns().iter().zip(&row.values) {
            features.push(name.clone(), f64::from(*value));
        }
        let p = payload.predict_features(&features).unwrap();
        assert!((p - model.predict_features(&features).unwrap()).abs() < 1e-12);
    }

    #[test]
    fn tagged_version_includes_tag() {
        let bundle = ModelBundle::new(
            Some("tuned"),
            "ela_dwt_svd",
            BTreeMap::new(),
            ConfigSnapshot::from_config(&LabConfig::default()),
        );
        assert!(bundle.model_version.starts_with("forensic-fusion-tuned-"));
        assert!(bundle.primary().is_none());
    }

    #[test]
    fn missing_feature_on_predict_is_reported() {
        let table = synthetic_table();
        let model = train_method("ela_only", &table, &LabConfig::default()).unwrap();
        let payload = MethodPayload::from(&model);
        let err = payload.predict_features(&Features::new()).unwrap_err();
        assert!(matches!(err, ForensicsError::MissingFeature(c) if c == "ela_mean"));
    }
}
