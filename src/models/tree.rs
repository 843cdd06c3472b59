//! Weighted CART classification trees (Gini impurity).

use ndarray::Array2;
use rand::{Rng, rngs::StdRng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::error::{ForensicsError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// Exhaustive search over midpoints between sorted values.
    #[default]
    Best,
    /// One uniform threshold per candidate feature.
    Random,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    All,
    #[default]
    Sqrt,
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        match self {
            MaxFeatures::All => n_features,
            MaxFeatures::Sqrt => ((n_features as f64).sqrt() as usize).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParams {
    pub max_depth: Option<usize>,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub splitter: Splitter,
}

impl Default for TreeParams {
    fn default() -> Self {
        Self {
            max_depth: None,
            min_samples_leaf: 1,
            max_features: MaxFeatures::All,
            splitter: Splitter::Best,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Leaf {
        probability: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClassMass {
    negative: f64,
    positive: f64,
}

impl ClassMass {
    fn add(&mut self, label: u8, weight: f64) {
        if label == 1 {
            self.positive += weight;
        } else {
            self.negative += weight;
        }
    }

    fn total(&self) -> f64 {
        self.negative + self.positive
    }

    fn gini(&self) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        let p = self.positive / total;
        2.0 * p * (1.0 - p)
    }

    /// Weighted impurity `W * gini`.
    fn weighted_gini(&self) -> f64 {
        self.total() * self.gini()
    }
}

#[derive(Debug, Clone, Copy)]
struct SplitChoice {
    feature: usize,
    threshold: f64,
    score: f64,
}

struct Builder<'a> {
    x: &'a Array2<f64>,
    y: &'a [u8],
    weights: &'a [f64],
    params: &'a TreeParams,
    nodes: Vec<Node>,
    importances: Vec<f64>,
}

impl Builder<'_> {
    fn mass(&self, samples: &[usize]) -> ClassMass {
        let mut mass = ClassMass::default();
        for &i in samples {
            mass.add(self.y[i], self.weights[i]);
        }
        mass
    }

    fn best_threshold(&self, samples: &[usize], feature: usize) -> Option<SplitChoice> {
        let min_leaf = self.params.min_samples_leaf;
        let mut sorted: Vec<usize> = samples.to_vec();
        sorted.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));

        let total = self.mass(samples);
        let mut left = ClassMass::default();
        let mut best: Option<SplitChoice> = None;
        for pos in 1..sorted.len() {
            let prev = sorted[pos - 1];
            left.add(self.y[prev], self.weights[prev]);
            if pos < min_leaf || sorted.len() - pos < min_leaf {
                continue;
            }
            let lo = self.x[[prev, feature]];
            let hi = self.x[[sorted[pos], feature]];
            if hi <= lo {
                continue;
            }
            let right = ClassMass {
                negative: total.negative - left.negative,
                positive: total.positive - left.positive,
            };
            let score = left.weighted_gini() + right.weighted_gini();
            if best.is_none_or(|b| score < b.score) {
                let mut threshold = lo + (hi - lo) / 2.0;
                if threshold >= hi {
                    threshold = lo;
                }
                best = Some(SplitChoice {
                    feature,
                    threshold,
                    score,
                });
            }
        }
        best
    }

    fn random_threshold(&self, samples: &[usize], feature: usize, rng: &mut StdRng) -> Option<SplitChoice> {
        let (lo, hi) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
            let v = self.x[[i, feature]];
            (lo.min(v), hi.max(v))
        });
        if hi <= lo {
            return None;
        }
        let threshold = rng.gen_range(lo..hi);

        let mut left = ClassMass::default();
        let mut right = ClassMass::default();
        let mut left_count = 0;
        for &i in samples {
            if self.x[[i, feature]] <= threshold {
                left.add(self.y[i], self.weights[i]);
                left_count += 1;
            } else {
                right.add(self.y[i], self.weights[i]);
            }
        }
        let min_leaf = self.params.min_samples_leaf;
        if left_count < min_leaf || samples.len() - left_count < min_leaf {
            return None;
        }
        Some(SplitChoice {
            feature,
            threshold,
            score: left.weighted_gini() + right.weighted_gini(),
        })
    }

    /// Visits at least `max_features` features and keeps going until a valid split is found.
    fn choose_split(&self, samples: &[usize], rng: &mut StdRng) -> Option<SplitChoice> {
        let n_features = self.x.ncols();
        let wanted = self.params.max_features.resolve(n_features);
        let mut order: Vec<usize> = (0..n_features).collect();
        order.shuffle(rng);

        let mut best: Option<SplitChoice> = None;
        for (visited, &feature) in order.iter().enumerate() {
            if visited >= wanted && best.is_some() {
                break;
            }
            let candidate = match self.params.splitter {
                Splitter::Best => self.best_threshold(samples, feature),
                Splitter::Random => self.random_threshold(samples, feature, rng),
            };
            match (candidate, best) {
                (Some(c), Some(b)) if c.score >= b.score => {}
                (Some(c), _) => best = Some(c),
                (None, _) => {}
            }
        }
        best
    }

    fn build(&mut self, root_samples: Vec<usize>, rng: &mut StdRng) {
        let mut stack = vec![(0usize, root_samples, 0usize)];
        self.nodes.push(Node::Leaf { probability: 0.5 });

        while let Some((node_idx, samples, depth)) = stack.pop() {
            let mass = self.mass(&samples);
            let probability = if mass.total() > 0.0 {
                mass.positive / mass.total()
            } else {
                0.5
            };
            self.nodes[node_idx] = Node::Leaf { probability };

            let depth_reached = self.params.max_depth.is_some_and(|d| depth >= d);
            let too_small = samples.len() < 2 * self.params.min_samples_leaf.max(1);
            let pure = mass.negative <= 0.0 || mass.positive <= 0.0;
            if depth_reached || too_small || pure {
                continue;
            }

            let Some(split) = self.choose_split(&samples, rng) else {
                continue;
            };
            let (left_samples, right_samples): (Vec<usize>, Vec<usize>) = samples
                .iter()
                .partition(|&&i| self.x[[i, split.feature]] <= split.threshold);
            if left_samples.is_empty() || right_samples.is_empty() {
                continue;
            }

            self.importances[split.feature] += mass.weighted_gini() - split.score;
            let left = self.nodes.len();
            self.nodes.push(Node::Leaf { probability });
            let right = self.nodes.len();
            self.nodes.push(Node::Leaf { probability });
            self.nodes[node_idx] = Node::Split {
                feature: split.feature,
                threshold: split.threshold,
                left,
                right,
            };
            stack.push((right, right_samples, depth + 1));
            stack.push((left, left_samples, depth + 1));
        }
    }
}

impl DecisionTree {
    /// Grows a tree on `samples` (indices into `x`, repeats allowed).
    pub fn fit(
        x: &Array2<f64>,
        y: &[u8],
        weights: &[f64],
        samples: Vec<usize>,
        params: &TreeParams,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if x.nrows() != y.len() || y.len() != weights.len() {
            return Err(ForensicsError::ModelFit("tree inputs have mismatched lengths".into()));
        }
        if samples.is_empty() {
            return Err(ForensicsError::ModelFit("cannot grow a tree on zero samples".into()));
        }
        if params.min_samples_leaf == 0 {
            return Err(ForensicsError::InvalidConfig("min_samples_leaf must be positive".into()));
        }

        let mut builder = Builder {
            x,
            y,
            weights,
            params,
            nodes: Vec::new(),
            importances: vec![0.0; x.ncols()],
        };
        builder.build(samples, rng);

        let mut importances = builder.importances;
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        Ok(Self {
            nodes: builder.nodes,
            importances,
        })
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { probability } => return *probability,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }

    /// Normalized total impurity decrease per feature.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match &nodes[idx] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }
}
