//! Classical classifiers and the scaler/selector/classifier pipeline.
//!
//! Every family is implemented in-crate on top of `ndarray` so a fitted
//! pipeline serializes to plain JSON inside the model bundle.

pub mod forest;
pub mod hist_gb;
pub mod logistic;
pub mod pipeline;
pub mod selection;
pub mod tree;

use serde::{Deserialize, Serialize};

pub use pipeline::{ClassifierSpec, FittedClassifier, Pipeline, PipelineSpec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeight {
    #[default]
    None,
    Balanced,
}

impl ClassWeight {
    pub fn sample_weights(&self, y: &[u8]) -> Vec<f64> {
        match self {
            ClassWeight::None => vec![1.0; y.len()],
            ClassWeight::Balanced => balanced_sample_weights(y),
        }
    }
}

/// `n / (2 * count(class))` per sample, so both classes carry equal mass.
pub fn balanced_sample_weights(y: &[u8]) -> Vec<f64> {
    let n = y.len() as f64;
    let positives = y.iter().filter(|&&v| v == 1).count() as f64;
    let negatives = n - positives;
    let weight = |count: f64| if count > 0.0 { n / (2.0 * count) } else { 0.0 };
    let (w0, w1) = (weight(negatives), weight(positives));
    y.iter().map(|&v| if v == 1 { w1 } else { w0 }).collect()
}

/// Per-feature signed contribution of one (already transformed) sample.
pub trait Explainable {
    fn contribution(&self, sample: &[f64]) -> Vec<f64>;
}

pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
