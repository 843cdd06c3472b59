use ndarray::Array2;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    models::{
        ClassWeight, Explainable,
        tree::{DecisionTree, MaxFeatures, Splitter, TreeParams},
    },
};

/// Random forests bootstrap rows and search the best threshold; extra trees
/// use every row and draw thresholds at random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForestKind {
    RandomForest,
    ExtraTrees,
}

impl ForestKind {
    fn bootstrap(&self) -> bool {
        matches!(self, ForestKind::RandomForest)
    }

    fn splitter(&self) -> Splitter {
        match self {
            ForestKind::RandomForest => Splitter::Best,
            ForestKind::ExtraTrees => Splitter::Random,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_estimators: usize,
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub class_weight: ClassWeight,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: None,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
            class_weight: ClassWeight::None,
        }
    }
}

impl ForestParams {
    pub fn validate(&self) -> Result<()> {
        if self.n_estimators == 0 {
            return Err(ForensicsError::InvalidConfig("n_estimators must be positive".into()));
        }
        if self.min_samples_leaf == 0 {
            return Err(ForensicsError::InvalidConfig("min_samples_leaf must be positive".into()));
        }
        if self.max_depth == Some(0) {
            return Err(ForensicsError::InvalidConfig("max_depth must be positive when set".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forest {
    kind: ForestKind,
    trees: Vec<DecisionTree>,
    importances: Vec<f64>,
}

impl Forest {
    /// Tree `i` draws from `StdRng::seed_from_u64(seed + i)`.
    pub fn fit(x: &Array2<f64>, y: &[u8], params: &ForestParams, kind: ForestKind, seed: u64) -> Result<Self> {
        params.validate()?;
        if x.nrows() != y.len() || y.is_empty() {
            return Err(ForensicsError::ModelFit(format!(
                "forest fit needs matching non-empty inputs, got {} rows and {} labels",
                x.nrows(),
                y.len()
            )));
        }

        let weights = params.class_weight.sample_weights(y);
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_leaf: params.min_samples_leaf,
            max_features: params.max_features,
            splitter: kind.splitter(),
        };
        let n = y.len();

        let trees = (0..params.n_estimators)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
                let samples: Vec<usize> = if kind.bootstrap() {
                    (0..n).map(|_| rng.gen_range(0..n)).collect()
                } else {
                    (0..n).collect()
                };
                DecisionTree::fit(x, y, &weights, samples, &tree_params, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut importances = vec![0.0; x.ncols()];
        for tree in &trees {
            for (acc, v) in importances.iter_mut().zip(tree.feature_importances()) {
                *acc += v;
            }
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }

        log::debug!("Fitted {:?} with {} trees", kind, trees.len());
        Ok(Self {
            kind,
            trees,
            importances,
        })
    }

    pub fn kind(&self) -> ForestKind {
        self.kind
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.predict_proba_row(row)).sum();
        sum / self.trees.len() as f64
    }

    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }
}

impl Explainable for Forest {
    fn contribution(&self, sample: &[f64]) -> Vec<f64> {
        sample
            .iter()
            .zip(&self.importances)
            .map(|(v, imp)| v.abs() * imp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> (Array2<f64>, Vec<u8>) {
        let mut x = Array2::zeros((40, 3));
        let mut y = Vec::new();
        for i in 0..40 {
            let label = (i % 2) as u8;
            let jitter = (i as f64 * 0.37).sin() * 0.3;
            x[[i, 0]] = if label == 1 { 2.0 + jitter } else { -2.0 + jitter };
            x[[i, 1]] = (i as f64 * 1.3).cos();
            x[[i, 2]] = (i as f64 * 0.7).sin();
            y.push(label);
        }
        (x, y)
    }

    fn params(n: usize) -> ForestParams {
        ForestParams {
            n_estimators: n,
            max_features: MaxFeatures::All,
            ..ForestParams::default()
        }
    }

    #[test]
    fn random_forest_separates_blobs() {
        let (x, y) = blobs();
        let forest = Forest::fit(&x, &y, &params(15), ForestKind::RandomForest, 7).unwrap();
        assert_eq!(forest.n_trees(), 15);
        assert!(forest.predict_proba_row(&[2.0, 0.0, 0.0]) > 0.8);
        assert!(forest.predict_proba_row(&[-2.0, 0.0, 0.0]) < 0.2);
        let imp = forest.feature_importances();
        assert!(imp[0] > imp[1] && imp[0] > imp[2]);
    }

    #[test]
    fn extra_trees_are_seed_deterministic() {
        let (x, y) = blobs();
        let a = Forest::fit(&x, &y, &params(5), ForestKind::ExtraTrees, 11).unwrap();
        let b = Forest::fit(&x, &y, &params(5), ForestKind::ExtraTrees, 11).unwrap();
        assert_eq!(a, b);
        assert!(a.predict_proba_row(&[2.0, 0.0, 0.0]) > a.predict_proba_row(&[-2.0, 0.0, 0.0]));
    }

    #[test]
    fn contribution_scales_magnitude_by_importance() {
        let (x, y) = blobs();
        let forest = Forest::fit(&x, &y, &params(3), ForestKind::RandomForest, 0).unwrap();
        let c = forest.contribution(&[-1.0, 0.0, 0.0]);
        assert_eq!(c[1], 0.0);
        assert!((c[0] - forest.feature_importances()[0]).abs() < 1e-12);
    }

    #[test]
    fn zero_estimators_is_invalid() {
        let (x, y) = blobs();
        assert!(Forest::fit(&x, &y, &params(0), ForestKind::RandomForest, 0).is_err());
    }
}
