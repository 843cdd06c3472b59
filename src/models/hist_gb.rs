//! Histogram gradient boosting for binary log-loss.
//!
//! Features are quantized into at most `max_bins` bins once, then each
//! boosting round grows one regression tree leaf-wise on the binned
//! gradients and hessians.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    image_utils,
    models::{ClassWeight, Explainable, sigmoid},
};

const MIN_HESSIAN_TO_SPLIT: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistGbParams {
    pub learning_rate: f64,
    pub max_iter: usize,
    pub max_leaf_nodes: usize,
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    pub l2_regularization: f64,
    pub max_bins: usize,
    pub class_weight: ClassWeight,
}

impl Default for HistGbParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            max_iter: 100,
            max_leaf_nodes: 31,
            max_depth: None,
            min_samples_leaf: 20,
            l2_regularization: 0.0,
            max_bins: 255,
            class_weight: ClassWeight::None,
        }
    }
}

impl HistGbParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ForensicsError::InvalidConfig(msg.to_string()));
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if self.max_iter == 0 {
            return invalid("max_iter must be positive");
        }
        if self.max_leaf_nodes < 2 {
            return invalid("max_leaf_nodes must be at least 2");
        }
        if self.max_depth == Some(0) {
            return invalid("max_depth must be positive when set");
        }
        if self.min_samples_leaf == 0 {
            return invalid("min_samples_leaf must be positive");
        }
        if self.l2_regularization < 0.0 {
            return invalid("l2_regularization must be non-negative");
        }
        if !(2..=256).contains(&self.max_bins) {
            return invalid("max_bins must be in 2..=256");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RegressionNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RegressionTree {
    nodes: Vec<RegressionNode>,
}

impl RegressionTree {
    fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                RegressionNode::Leaf { value } => return *value,
                RegressionNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }
}

/// Upper bin edges per feature: a value `v` falls in bin `#{edges < v}`.
fn bin_edges(values: &[f64], max_bins: usize) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mut distinct = sorted.clone();
    distinct.dedup();

    if distinct.len() <= max_bins {
        return distinct.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }
    let mut edges: Vec<f64> = (1..max_bins)
        .map(|k| image_utils::percentile_sorted(&sorted, 100.0 * k as f64 / max_bins as f64))
        .collect();
    edges.dedup();
    edges
}

fn bin_of(edges: &[f64], v: f64) -> usize {
    edges.partition_point(|&e| e < v)
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    feature: usize,
    bin: usize,
    gain: f64,
}

struct GrowingLeaf {
    node: usize,
    samples: Vec<usize>,
    depth: usize,
    grad: f64,
    hess: f64,
    split: Option<Candidate>,
}

struct TreeGrower<'a> {
    binned: &'a [Vec<u16>],
    n_bins: &'a [usize],
    edges: &'a [Vec<f64>],
    gradients: &'a [f64],
    hessians: &'a [f64],
    params: &'a HistGbParams,
}

impl TreeGrower<'_> {
    fn score(&self, g: f64, h: f64) -> f64 {
        g * g / (h + self.params.l2_regularization)
    }

    fn find_split(&self, samples: &[usize], grad: f64, hess: f64) -> Option<Candidate> {
        let min_leaf = self.params.min_samples_leaf;
        if samples.len() < 2 * min_leaf {
            return None;
        }
        let parent = self.score(grad, hess);
        let mut best: Option<Candidate> = None;

        for (feature, bins) in self.binned.iter().enumerate() {
            let n_bins = self.n_bins[feature];
            if n_bins < 2 {
                continue;
            }
            let mut hist_g = vec![0.0; n_bins];
            let mut hist_h = vec![0.0; n_bins];
            let mut hist_n = vec![0usize; n_bins];
            for &i in samples {
                let b = bins[i] as usize;
                hist_g[b] += self.gradients[i];
                hist_h[b] += self.hessians[i];
                hist_n[b] += 1;
            }

            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for bin in 0..n_bins - 1 {
                gl += hist_g[bin];
                hl += hist_h[bin];
                nl += hist_n[bin];
                let nr = samples.len() - nl;
                if nl < min_leaf {
                    continue;
                }
                if nr < min_leaf {
                    break;
                }
                let (gr, hr) = (grad - gl, hess - hl);
                if hl < MIN_HESSIAN_TO_SPLIT || hr < MIN_HESSIAN_TO_SPLIT {
                    continue;
                }
                let gain = self.score(gl, hl) + self.score(gr, hr) - parent;
                if gain > 1e-12 && best.is_none_or(|b| gain > b.gain) {
                    best = Some(Candidate { feature, bin, gain });
                }
            }
        }
        best
    }

    fn leaf(&self, node: usize, samples: Vec<usize>, depth: usize) -> GrowingLeaf {
        let grad = samples.iter().map(|&i| self.gradients[i]).sum();
        let hess = samples.iter().map(|&i| self.hessians[i]).sum();
        let can_split = self.params.max_depth.is_none_or(|d| depth < d);
        let split = if can_split { self.find_split(&samples, grad, hess) } else { None };
        GrowingLeaf {
            node,
            samples,
            depth,
            grad,
            hess,
            split,
        }
    }

    /// Best-first growth; returns the tree and the leaf value of every training row.
    fn grow(&self, n_samples: usize) -> (RegressionTree, Vec<f64>) {
        let mut nodes = vec![RegressionNode::Leaf { value: 0.0 }];
        let mut open = vec![self.leaf(0, (0..n_samples).collect(), 0)];

        while open.len() < self.params.max_leaf_nodes {
            let best = open
                .iter()
                .enumerate()
                .filter_map(|(i, l)| l.split.map(|s| (i, s)))
                .max_by(|a, b| a.1.gain.total_cmp(&b.1.gain));
            let Some((pos, split)) = best else { break };

            let leaf = open.swap_remove(pos);
            let edges = &self.edges[split.feature];
            let bins = &self.binned[split.feature];
            let (left_samples, right_samples): (Vec<usize>, Vec<usize>) =
                leaf.samples.iter().partition(|&&i| bins[i] as usize <= split.bin);

            let left = nodes.len();
            nodes.push(RegressionNode::Leaf { value: 0.0 });
            let right = nodes.len();
            nodes.push(RegressionNode::Leaf { value: 0.0 });
            nodes[leaf.node] = RegressionNode::Split {
                feature: split.feature,
                threshold: edges[split.bin],
                left,
                right,
            };
            open.push(self.leaf(left, left_samples, leaf.depth + 1));
            open.push(self.leaf(right, right_samples, leaf.depth + 1));
        }
        let mut row_values = vec![0.0; n_samples];
        for leaf in open {
            let value =
                -leaf.grad / (leaf.hess + self.params.l2_regularization) * self.params.learning_rate;
            let value = if value.is_finite() { value } else { 0.0 };
            nodes[leaf.node] = RegressionNode::Leaf { value };
            for i in leaf.samples {
                row_values[i] = value;
            }
        }
        (RegressionTree { nodes }, row_values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistGradientBoosting {
    baseline: f64,
    trees: Vec<RegressionTree>,
}

impl HistGradientBoosting {
    pub fn fit(x: &Array2<f64>, y: &[u8], params: &HistGbParams) -> Result<Self> {
        params.validate()?;
        let n = y.len();
        if x.nrows() != n || n == 0 {
            return Err(ForensicsError::ModelFit(format!(
                "boosting fit needs matching non-empty inputs, got {} rows and {} labels",
                x.nrows(),
                n
            )));
        }

        let weights = params.class_weight.sample_weights(y);
        let total_weight: f64 = weights.iter().sum();
        let positive_weight: f64 = y.iter().zip(&weights).filter(|(l, _)| **l == 1).map(|(_, w)| w).sum();
        let p0 = (positive_weight / total_weight).clamp(1e-15, 1.0 - 1e-15);
        let baseline = (p0 / (1.0 - p0)).ln();

        let mut edges = Vec::with_capacity(x.ncols());
        let mut binned = Vec::with_capacity(x.ncols());
        for column in x.axis_iter(Axis(1)) {
            let values = column.to_vec();
            let feature_edges = bin_edges(&values, params.max_bins);
            binned.push(values.iter().map(|&v| bin_of(&feature_edges, v) as u16).collect::<Vec<u16>>());
            edges.push(feature_edges);
        }
        let n_bins: Vec<usize> = edges.iter().map(|e| e.len() + 1).collect();

        let targets: Vec<f64> = y.iter().map(|&v| f64::from(v)).collect();
        let mut raw = vec![baseline; n];
        let mut trees = Vec::with_capacity(params.max_iter);
        let mut gradients = vec![0.0; n];
        let mut hessians = vec![0.0; n];

        for _ in 0..params.max_iter {
            for i in 0..n {
                let p = sigmoid(raw[i]);
                gradients[i] = weights[i] * (p - targets[i]);
                hessians[i] = weights[i] * p * (1.0 - p);
            }
            let grower = TreeGrower {
                binned: &binned,
                n_bins: &n_bins,
                edges: &edges,
                gradients: &gradients,
                hessians: &hessians,
                params,
            };
            let (tree, row_values) = grower.grow(n);
            let single_leaf = tree.nodes.len() == 1;
            for (r, v) in raw.iter_mut().zip(&row_values) {
                *r += v;
            }
            trees.push(tree);
            if single_leaf {
                log::trace!("boosting stopped early: no further split improves the loss");
                break;
            }
        }

        Ok(Self { baseline, trees })
    }

    pub fn raw_score(&self, row: &[f64]) -> f64 {
        self.baseline + self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> f64 {
        sigmoid(self.raw_score(row))
    }
}

/// No per-feature weights exist for boosted trees; the magnitude of the
/// standardized input is used as-is.
impl Explainable for HistGradientBoosting {
    fn contribution(&self, sample: &[f64]) -> Vec<f64> {
        sample.iter().map(|v| v.abs()).collect()
    }
}
