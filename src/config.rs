//! Typed experiment configuration.
//!
//! Configuration is read once from JSON, relative paths are resolved against
//! the config file's directory, and the whole tree is validated before any
//! work starts. Every section has defaults so partial files are accepted.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        cfa_analysis::CfaConfig, dwt_svd::DwtConfig, ela::ElaConfig, mantra::MantraConfig,
        prnu_analysis::PrnuConfig,
    },
    error::{ForensicsError, Result},
    evaluation::{metrics::TargetMetric, perturb::Scenario},
    features::methods,
    models::pipeline::PipelineSpec,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub experiment: ExperimentConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub evaluation: EvaluationConfig,
    pub robustness: RobustnessConfig,
    pub tuning: TuningConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub name: String,
    pub seed: u64,
    /// `[height, width]` every image is resized to before extraction.
    pub image_size: [u32; 2],
    pub methods: Vec<String>,
    pub primary_method: String,
    pub baseline_method: String,
    pub source_dataset: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            name: "forensic-fusion".into(),
            seed: 42,
            image_size: [256, 256],
            methods: vec![
                "ela_only".into(),
                "dwt_svd_only".into(),
                "ela_dwt".into(),
                "ela_dwt_svd".into(),
            ],
            primary_method: "ela_dwt_svd".into(),
            baseline_method: "ela_dwt".into(),
            source_dataset: "custom".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub ela: ElaConfig,
    pub dwt: DwtConfig,
    pub cfa: CfaConfig,
    pub prnu: PrnuConfig,
    pub mantra: MantraConfig,
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<()> {
        self.ela.validate()?;
        self.dwt.validate()?;
        self.cfa.validate()?;
        self.prnu.validate()?;
        self.mantra.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub min_threshold: f64,
    pub max_threshold: f64,
    pub steps: usize,
    pub metric: TargetMetric,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            min_threshold: 0.1,
            max_threshold: 0.9,
            steps: 81,
            metric: TargetMetric::F1,
        }
    }
}

impl ThresholdConfig {
    /// Finer grid used when sweeping tuning candidates.
    pub fn tuning() -> Self {
        Self {
            steps: 161,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |t: f64| t > 0.0 && t < 1.0;
        if !in_unit(self.min_threshold) || !in_unit(self.max_threshold) {
            return Err(ForensicsError::InvalidConfig(
                "threshold bounds must lie strictly inside (0, 1)".into(),
            ));
        }
        if self.min_threshold > self.max_threshold {
            return Err(ForensicsError::InvalidConfig(format!(
                "min_threshold {} exceeds max_threshold {}",
                self.min_threshold, self.max_threshold
            )));
        }
        if self.steps == 0 {
            return Err(ForensicsError::InvalidConfig("threshold steps must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub pipeline: PipelineSpec,
    pub threshold_tuning: ThresholdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub bootstrap_samples: usize,
    pub confidence_level: f64,
    pub error_top_k: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            bootstrap_samples: 1000,
            confidence_level: 0.95,
            error_top_k: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustnessConfig {
    pub enabled: bool,
    pub scenarios: Vec<Scenario>,
}

impl Default for RobustnessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scenarios: Scenario::default_suite(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub threshold: ThresholdConfig,
    /// Replaces the built-in candidate grid when set.
    pub candidates: Option<Vec<PipelineSpec>>,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            threshold: ThresholdConfig::tuning(),
            candidates: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub manifest_csv: PathBuf,
    pub artifacts_dir: PathBuf,
    pub models_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub reports_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_csv: PathBuf::from("data/manifest.csv"),
            artifacts_dir: PathBuf::from("artifacts"),
            models_dir: PathBuf::from("artifacts/models"),
            metrics_dir: PathBuf::from("artifacts/metrics"),
            reports_dir: PathBuf::from("artifacts/reports"),
        }
    }
}

impl PathsConfig {
    pub fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.manifest_csv,
            &mut self.artifacts_dir,
            &mut self.models_dir,
            &mut self.metrics_dir,
            &mut self.reports_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    pub fn output_dirs(&self) -> [&Path; 4] {
        [
            &self.artifacts_dir,
            &self.models_dir,
            &self.metrics_dir,
            &self.reports_dir,
        ]
    }
}

impl LabConfig {
    /// Loads, resolves and validates a JSON config file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut config: LabConfig = serde_json::from_str(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.paths.resolve_against(base);
        config.validate()?;
        log::debug!("loaded config '{}' from {}", config.experiment.name, path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let [height, width] = self.experiment.image_size;
        if height < 16 || width < 16 {
            return Err(ForensicsError::InvalidConfig(format!(
                "image_size must be at least 16x16, got {height}x{width}"
            )));
        }
        if self.experiment.methods.is_empty() {
            return Err(ForensicsError::InvalidConfig("experiment.methods is empty".into()));
        }
        for method in &self.experiment.methods {
            methods::validate_method_name(method)?;
        }
        if !self.experiment.methods.contains(&self.experiment.primary_method) {
            return Err(ForensicsError::InvalidConfig(format!(
                "primary method '{}' is not listed in experiment.methods",
                self.experiment.primary_method
            )));
        }
        methods::validate_method_name(&self.experiment.baseline_method)?;

        self.features.validate()?;
        self.model.pipeline.validate()?;
        self.model.threshold_tuning.validate()?;
        self.tuning.threshold.validate()?;
        if let Some(candidates) = &self.tuning.candidates {
            for candidate in candidates {
                candidate.validate()?;
            }
        }

        if self.evaluation.bootstrap_samples == 0 {
            return Err(ForensicsError::InvalidConfig(
                "evaluation.bootstrap_samples must be positive".into(),
            ));
        }
        if !(self.evaluation.confidence_level > 0.0 && self.evaluation.confidence_level < 1.0) {
            return Err(ForensicsError::InvalidConfig(
                "evaluation.confidence_level must lie in (0, 1)".into(),
            ));
        }
        for scenario in &self.robustness.scenarios {
            scenario.validate()?;
        }
        Ok(())
    }
}
