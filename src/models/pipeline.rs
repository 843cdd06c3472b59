use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    models::{
        Explainable,
        forest::{Forest, ForestKind, ForestParams},
        hist_gb::{HistGbParams, HistGradientBoosting},
        logistic::{LogisticParams, LogisticRegression},
        selection::{SelectKBest, Standardizer},
    },
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ClassifierSpec {
    Logistic(LogisticParams),
    RandomForest(ForestParams),
    ExtraTrees(ForestParams),
    HistGb(HistGbParams),
}

impl Default for ClassifierSpec {
    fn default() -> Self {
        ClassifierSpec::Logistic(LogisticParams::default())
    }
}

impl ClassifierSpec {
    pub fn family(&self) -> &'static str {
        match self {
            ClassifierSpec::Logistic(_) => "logistic",
            ClassifierSpec::RandomForest(_) => "random_forest",
            ClassifierSpec::ExtraTrees(_) => "extra_trees",
            ClassifierSpec::HistGb(_) => "hist_gb",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ClassifierSpec::Logistic(p) => p.validate(),
            ClassifierSpec::RandomForest(p) | ClassifierSpec::ExtraTrees(p) => p.validate(),
            ClassifierSpec::HistGb(p) => p.validate(),
        }
    }
}

/// Standardizer, then optional SelectKBest, then one classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub classifier: ClassifierSpec,
}

impl PipelineSpec {
    pub fn new(classifier: ClassifierSpec, top_k: Option<usize>) -> Self {
        Self { top_k, classifier }
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == Some(0) {
            return Err(ForensicsError::InvalidConfig("top_k must be positive when set".into()));
        }
        self.classifier.validate()
    }

    /// Compact JSON of the classifier parameters, for sweep tables.
    pub fn params_json(&self) -> String {
        serde_json::to_string(&self.classifier).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum FittedClassifier {
    Logistic(LogisticRegression),
    Forest(Forest),
    HistGb(HistGradientBoosting),
}

impl FittedClassifier {
    fn fit(spec: &ClassifierSpec, x: &Array2<f64>, y: &[u8], seed: u64) -> Result<Self> {
        Ok(match spec {
            ClassifierSpec::Logistic(p) => FittedClassifier::Logistic(LogisticRegression::fit(x, y, p)?),
            ClassifierSpec::RandomForest(p) => {
                FittedClassifier::Forest(Forest::fit(x, y, p, ForestKind::RandomForest, seed)?)
            }
            ClassifierSpec::ExtraTrees(p) => {
                FittedClassifier::Forest(Forest::fit(x, y, p, ForestKind::ExtraTrees, seed)?)
            }
            ClassifierSpec::HistGb(p) => FittedClassifier::HistGb(HistGradientBoosting::fit(x, y, p)?),
        })
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> f64 {
        match self {
            FittedClassifier::Logistic(m) => m.predict_proba_row(row),
            FittedClassifier::Forest(m) => m.predict_proba_row(row),
            FittedClassifier::HistGb(m) => m.predict_proba_row(row),
        }
    }
}

impl Explainable for FittedClassifier {
    fn contribution(&self, sample: &[f64]) -> Vec<f64> {
        match self {
            FittedClassifier::Logistic(m) => m.contribution(sample),
            FittedClassifier::Forest(m) => m.contribution(sample),
            FittedClassifier::HistGb(m) => m.contribution(sample),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    spec: PipelineSpec,
    standardizer: Standardizer,
    selector: Option<SelectKBest>,
    classifier: FittedClassifier,
}

impl Pipeline {
    /// Fits every stage on the given rows only.
    pub fn fit(spec: &PipelineSpec, x: &Array2<f64>, y: &[u8], seed: u64) -> Result<Self> {
        spec.validate()?;
        if x.nrows() != y.len() || y.is_empty() {
            return Err(ForensicsError::ModelFit(format!(
                "{} rows but {} labels",
                x.nrows(),
                y.len()
            )));
        }
        if x.ncols() == 0 {
            return Err(ForensicsError::ModelFit("no feature columns".into()));
        }
        if !y.contains(&0) || !y.contains(&1) {
            return Err(ForensicsError::ModelFit("training labels must contain both classes".into()));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ForensicsError::ModelFit("training matrix contains non-finite values".into()));
        }

        let standardizer = Standardizer::fit(x)?;
        let scaled = standardizer.transform(x);
        let (selector, model_input) = match spec.top_k {
            Some(k) => {
                let selector = SelectKBest::fit(&scaled, y, k)?;
                let reduced = selector.transform(&scaled);
                (Some(selector), reduced)
            }
            None => (None, scaled),
        };
        let classifier = FittedClassifier::fit(&spec.classifier, &model_input, y, seed)?;

        Ok(Self {
            spec: spec.clone(),
            standardizer,
            selector,
            classifier,
        })
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn classifier(&self) -> &FittedClassifier {
        &self.classifier
    }

    pub fn n_features(&self) -> usize {
        self.standardizer.n_features()
    }

    fn transform_row(&self, row: &[f64]) -> Result<Vec<f64>> {
        if row.len() != self.n_features() {
            return Err(ForensicsError::InvalidParameter(format!(
                "pipeline expects {} features, got {}",
                self.n_features(),
                row.len()
            )));
        }
        let scaled = self.standardizer.transform_row(row);
        Ok(match &self.selector {
            Some(selector) => selector.transform_row(&scaled),
            None => scaled,
        })
    }

    /// Probability of the manipulated class for one raw feature row.
    pub fn predict_one(&self, row: &[f64]) -> Result<f64> {
        let input = self.transform_row(row)?;
        Ok(self.classifier.predict_proba_row(&input))
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Vec<f64>> {
        x.rows()
            .into_iter()
            .map(|row| match row.as_slice() {
                Some(slice) => self.predict_one(slice),
                None => self.predict_one(&row.to_vec()),
            })
            .collect()
    }

    /// Contribution of each surviving input column, keyed by its raw column index.
    pub fn contribution(&self, row: &[f64]) -> Result<Vec<(usize, f64)>> {
        let input = self.transform_row(row)?;
        let values = self.classifier.contribution(&input);
        let indices: Vec<usize> = match &self.selector {
            Some(selector) => selector.support().to_vec(),
            None => (0..self.n_features()).collect(),
        };
        Ok(indices.into_iter().zip(values).collect())
    }

    /// Names of the `k` columns with the largest absolute contribution.
    pub fn top_features(&self, row: &[f64], columns: &[String], k: usize) -> Result<Vec<String>> {
        if columns.len() != self.n_features() {
            return Err(ForensicsError::InvalidParameter(format!(
                "{} column names for a {}-feature pipeline",
                columns.len(),
                self.n_features()
            )));
        }
        let mut ranked = self.contribution(row)?;
        ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(idx, _)| columns[idx].clone())
            .collect())
    }
}
