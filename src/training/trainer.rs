use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::Features,
    config::{LabConfig, ThresholdConfig},
    error::Result,
    evaluation::{
        PredictionRow,
        metrics::{BinaryMetrics, TargetMetric, compute_binary_metrics},
        robustness::MethodScorer,
    },
    features::{FeatureTable, Split, SplitData, require_method_columns},
    models::{Pipeline, PipelineSpec},
};

/// Which threshold wins when several reach the same validation score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// First grid point reaching the best score. The grid is ascending.
    #[default]
    LowestThreshold,
    HighestThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdChoice {
    pub threshold: f64,
    pub score: f64,
}

/// `steps` evenly spaced points from `min_threshold` to `max_threshold` inclusive.
pub fn threshold_grid(config: &ThresholdConfig) -> Vec<f64> {
    let (lo, hi, steps) = (config.min_threshold, config.max_threshold, config.steps);
    match steps {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (steps - 1) as f64;
            (0..steps)
                .map(|i| if i == steps - 1 { hi } else { lo + step * i as f64 })
                .collect()
        }
    }
}

/// Picks the grid threshold maximizing `metric` on the given (validation) scores.
///
/// NaN scores never win. When nothing scores, the threshold stays at 0.5.
pub fn select_threshold(
    y_true: &[u8],
    y_prob: &[f64],
    grid: &[f64],
    metric: TargetMetric,
    tie_break: TieBreak,
) -> Result<ThresholdChoice> {
    let mut best = ThresholdChoice {
        threshold: 0.5,
        score: f64::NEG_INFINITY,
    };
    for &threshold in grid {
        let score = compute_binary_metrics(y_true, y_prob, threshold)?.get(metric);
        let better = match tie_break {
            TieBreak::LowestThreshold => score > best.score,
            TieBreak::HighestThreshold => score >= best.score,
        };
        if better {
            best = ThresholdChoice { threshold, score };
        }
    }
    Ok(best)
}

/// The three splits of the feature table projected onto one method's columns.
#[derive(Debug, Clone)]
pub struct MethodData {
    pub method: String,
    pub columns: Vec<String>,
    pub train: SplitData,
    pub val: SplitData,
    pub test: SplitData,
}

impl MethodData {
    pub fn from_table(table: &FeatureTable, method: &str) -> Result<Self> {
        let columns = require_method_columns(method, table.columns())?;
        Ok(Self {
            method: method.to_string(),
            train: table.split_data(Split::Train, &columns)?,
            val: table.split_data(Split::Val, &columns)?,
            test: table.split_data(Split::Test, &columns)?,
            columns,
        })
    }

    pub fn split(&self, split: Split) -> &SplitData {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }
}

/// A fitted method with its frozen columns, threshold and per-split results.
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub method: String,
    pub pipeline: Pipeline,
    pub feature_columns: Vec<String>,
    pub threshold: f64,
    pub split_metrics: BTreeMap<Split, BinaryMetrics>,
    pub predictions: BTreeMap<Split, Vec<PredictionRow>>,
}

impl TrainedModel {
    pub fn metrics(&self, split: Split) -> Option<&BinaryMetrics> {
        self.split_metrics.get(&split)
    }

    pub fn split_predictions(&self, split: Split) -> &[PredictionRow] {
        self.predictions.get(&split).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Probability for a freshly extracted feature set, using the stored columns.
    pub fn predict_features(&self, features: &Features) -> Result<f64> {
        predict_with_columns(&self.pipeline, &self.feature_columns, features)
    }
}

impl MethodScorer for TrainedModel {
    fn threshold(&self) -> f64 {
        self.threshold
    }

    fn clean_test_f1(&self) -> f64 {
        self.metrics(Split::Test).map_or(0.0, |m| m.f1)
    }

    fn score_features(&self, features: &Features) -> Result<f64> {
        self.predict_features(features)
    }
}

/// Values are rounded through `f32` like the persisted feature table.
pub(crate) fn predict_with_columns(pipeline: &Pipeline, columns: &[String], features: &Features) -> Result<f64> {
    let row: Vec<f64> = features
        .select(columns)?
        .into_iter()
        .map(|v| v as f32 as f64)
        .collect();
    pipeline.predict_one(&row)
}

fn score_split(pipeline: &Pipeline, data: &SplitData, threshold: f64) -> Result<(BinaryMetrics, Vec<PredictionRow>)> {
    let probs = pipeline.predict_proba(&data.x)?;
    let metrics = compute_binary_metrics(&data.y, &probs, threshold)?;
    let rows = data
        .paths
        .iter()
        .zip(&data.y)
        .zip(&probs)
        .map(|((path, &label), &p)| PredictionRow::new(path.clone(), label, p, threshold))
        .collect();
    Ok((metrics, rows))
}

/// Fits on train, selects the threshold on validation, then scores every split.
pub fn fit_calibrated(
    data: &MethodData,
    spec: &PipelineSpec,
    threshold_config: &ThresholdConfig,
    seed: u64,
) -> Result<TrainedModel> {
    let pipeline = Pipeline::fit(spec, &data.train.x, &data.train.y, seed)?;

    let val_probs = pipeline.predict_proba(&data.val.x)?;
    let choice = select_threshold(
        &data.val.y,
        &val_probs,
        &threshold_grid(threshold_config),
        threshold_config.metric,
        TieBreak::LowestThreshold,
    )?;

    let mut split_metrics = BTreeMap::new();
    let mut predictions = BTreeMap::new();
    for split in Split::ALL {
        let (metrics, rows) = score_split(&pipeline, data.split(split), choice.threshold)?;
        split_metrics.insert(split, metrics);
        predictions.insert(split, rows);
    }

    Ok(TrainedModel {
        method: data.method.clone(),
        pipeline,
        feature_columns: data.columns.clone(),
        threshold: choice.threshold,
        split_metrics,
        predictions,
    })
}

pub fn train_method(method: &str, table: &FeatureTable, config: &LabConfig) -> Result<TrainedModel> {
    let data = MethodData::from_table(table, method)?;
    let model = fit_calibrated(
        &data,
        &config.model.pipeline,
        &config.model.threshold_tuning,
        config.experiment.seed,
    )?;
    if let Some(test) = model.metrics(Split::Test) {
        log::info!(
            "{}: {} columns, threshold {:.4}, test F1 {:.4}",
            method,
            model.feature_columns.len(),
            model.threshold,
            test.f1
        );
    }
    Ok(model)
}

pub fn train_methods(table: &FeatureTable, config: &LabConfig) -> Result<BTreeMap<String, TrainedModel>> {
    let mut models = BTreeMap::new();
    for method in &config.experiment.methods {
        log::info!("Training method: {}", method);
        models.insert(method.clone(), train_method(method, table, config)?);
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ForensicsError,
        features::FeatureRow,
        models::{ClassifierSpec, forest::ForestParams},
        training::fixtures::synthetic_table,
    };
    use approx::assert_abs_diff_eq;

    #[test]
    fn grid_is_inclusive_linspace() {
        let grid = threshold_grid(&ThresholdConfig::default());
        assert_eq!(grid.len(), 81);
        assert_eq!(grid[0], 0.1);
        assert_eq!(*grid.last().unwrap(), 0.9);
        assert_abs_diff_eq!(grid[40], 0.5, epsilon = 1e-12);
        assert_eq!(threshold_grid(&ThresholdConfig::tuning()).len(), 161);
    }

    #[test]
    fn ties_keep_lowest_threshold() {
        let y = [0, 0, 1, 1];
        let p = [0.1, 0.2, 0.8, 0.9];
        let grid = [0.3, 0.5, 0.7];
        let low = select_threshold(&y, &p, &grid, TargetMetric::F1, TieBreak::LowestThreshold).unwrap();
        assert_eq!(low.threshold, 0.3);
        assert_eq!(low.score, 1.0);
        let high = select_threshold(&y, &p, &grid, TargetMetric::F1, TieBreak::HighestThreshold).unwrap();
        assert_eq!(high.threshold, 0.7);
    }

    #[test]
    fn nan_scores_fall_back_to_half() {
        let choice = select_threshold(&[1, 1], &[0.3, 0.6], &[0.2, 0.4], TargetMetric::RocAuc, TieBreak::LowestThreshold)
            .unwrap();
        assert_eq!(choice.threshold, 0.5);
    }

    #[test]
    fn threshold_comes_from_validation_only() {
        let table = synthetic_table();
        let data = MethodData::from_table(&table, "ela_dwt").unwrap();
        let config = LabConfig::default();
        let model = fit_calibrated(&data, &config.model.pipeline, &config.model.threshold_tuning, 7).unwrap();

        let val = &model.predictions[&Split::Val];
        let probs: Vec<f64> = val.iter().map(|r| r.probability).collect();
        let labels: Vec<u8> = val.iter().map(|r| r.label).collect();
        let expected = select_threshold(
            &labels,
            &probs,
            &threshold_grid(&config.model.threshold_tuning),
            TargetMetric::F1,
            TieBreak::LowestThreshold,
        )
        .unwrap();
        assert_eq!(model.threshold, expected.threshold);
        for split in Split::ALL {
            assert_eq!(model.metrics(split).unwrap().threshold, model.threshold);
        }
    }

    #[test]
    fn trained_method_keeps_its_columns_and_scores_every_split() {
        let table = synthetic_table();
        let model = train_method("ela_dwt", &table, &LabConfig::default()).unwrap();
        assert_eq!(model.feature_columns, vec!["ela_mean", "ela_std", "dwt_l1_hh_energy"]);
        assert_eq!(model.split_predictions(Split::Train).len(), 36);
        assert_eq!(model.split_predictions(Split::Test).len(), 12);
        assert!(model.metrics(Split::Train).unwrap().accuracy > 0.8);

        let mut features = Features::new();
        for (name, value) in table.columns().iter().zip(&table.rows()[1].values) {
            features.push(name.clone(), f64::from(*value));
        }
        let direct = model.predict_features(&features).unwrap();
        assert_abs_diff_eq!(direct, model.split_predictions(Split::Test)[0].probability, epsilon = 1e-12);
    }

    #[test]
    fn same_seed_gives_same_threshold_and_metrics() {
        let table = synthetic_table();
        let mut config = LabConfig::default();
        config.model.pipeline = PipelineSpec::new(ClassifierSpec::RandomForest(ForestParams::default()), None);

        let first = train_method("ela_dwt_svd", &table, &config).unwrap();
        let second = train_method("ela_dwt_svd", &table, &config).unwrap();
        assert_eq!(first.threshold, second.threshold);
        for split in Split::ALL {
            let (a, b) = (first.metrics(split).unwrap(), second.metrics(split).unwrap());
            assert_eq!((a.tn, a.fp, a.fn_, a.tp), (b.tn, b.fp, b.fn_, b.tp));
            assert_eq!(a.f1, b.f1);
            assert!(a.roc_auc == b.roc_auc || (a.roc_auc.is_nan() && b.roc_auc.is_nan()));
        }
        assert_eq!(first.predictions, second.predictions);
    }

    #[test]
    fn method_without_columns_is_rejected() {
        let err = train_method("prnu_only", &synthetic_table(), &LabConfig::default()).unwrap_err();
        assert!(matches!(err, ForensicsError::NoFeatureColumns(m) if m == "prnu_only"));
    }

    #[test]
    fn empty_split_is_fatal() {
        let mut table = FeatureTable::new(vec!["ela_mean".into()]);
        table
            .push(FeatureRow {
                image_path: "a.png".into(),
                label: 0,
                split: Split::Train,
                source_dataset: String::new(),
                perturbation_tag: "clean".into(),
                mask_path: None,
                values: vec![0.0],
            })
            .unwrap();
        assert!(matches!(
            MethodData::from_table(&table, "ela_only"),
            Err(ForensicsError::EmptySplit(_))
        ));
    }
}
