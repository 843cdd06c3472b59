use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ForensicsError, Result};

/// Zero-mean, unit-variance scaling fit on the training split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    /// Constant columns keep a scale of 1.
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(ForensicsError::ModelFit("cannot standardize zero rows".into()));
        }
        let n = x.nrows() as f64;
        let mut mean = Vec::with_capacity(x.ncols());
        let mut scale = Vec::with_capacity(x.ncols());
        for column in x.axis_iter(Axis(1)) {
            let m = column.sum() / n;
            let var = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let sd = var.sqrt();
            mean.push(m);
            scale.push(if sd > f64::EPSILON * m.abs().max(1.0) { sd } else { 1.0 });
        }
        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut out = x.clone();
        for (j, mut column) in out.axis_iter_mut(Axis(1)).enumerate() {
            column.mapv_inplace(|v| (v - self.mean[j]) / self.scale[j]);
        }
        out
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect()
    }
}

/// One-way ANOVA F statistic of each column against the binary label.
pub fn f_classif(x: &Array2<f64>, y: &[u8]) -> Vec<f64> {
    let n = x.nrows() as f64;
    let groups = 2.0;
    x.axis_iter(Axis(1))
        .map(|column| {
            let mut sum = [0.0; 2];
            let mut count = [0.0; 2];
            for (&v, &label) in column.iter().zip(y) {
                let c = usize::from(label == 1);
                sum[c] += v;
                count[c] += 1.0;
            }
            let grand = (sum[0] + sum[1]) / n;
            let mut ss_between = 0.0;
            let mut ss_within = 0.0;
            for c in 0..2 {
                if count[c] == 0.0 {
                    continue;
                }
                let class_mean = sum[c] / count[c];
                ss_between += count[c] * (class_mean - grand).powi(2);
            }
            for (&v, &label) in column.iter().zip(y) {
                let c = usize::from(label == 1);
                ss_within += (v - sum[c] / count[c]).powi(2);
            }
            let between = ss_between / (groups - 1.0);
            let within = ss_within / (n - groups);
            between / within
        })
        .collect()
}

/// Keeps the `k` columns with the highest F statistic, in column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectKBest {
    k: usize,
    support: Vec<usize>,
}

impl SelectKBest {
    pub fn fit(x: &Array2<f64>, y: &[u8], k: usize) -> Result<Self> {
        if k == 0 || k > x.ncols() {
            return Err(ForensicsError::ModelFit(format!(
                "k={k} must be in 1..={} for SelectKBest",
                x.ncols()
            )));
        }
        let scores: Vec<f64> = f_classif(x, y)
            .into_iter()
            .map(|s| if s.is_nan() { f64::MIN } else { s })
            .collect();

        // Stable ascending sort; ties resolve toward later columns.
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
        let mut support = order[order.len() - k..].to_vec();
        support.sort_unstable();
        Ok(Self { k, support })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Selected column indices, ascending.
    pub fn support(&self) -> &[usize] {
        &self.support
    }

    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        x.select(Axis(1), &self.support)
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f64> {
        self.support.iter().map(|&j| row[j]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn standardizer_centers_and_scales() {
        let x = array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]];
        let s = Standardizer::fit(&x).unwrap();
        let t = s.transform(&x);
        assert_relative_eq!(t.column(0).sum(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(t[[2, 0]], 2.0 / (8.0f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert!(t.column(1).iter().all(|&v| v == 0.0));
        assert_eq!(s.transform_row(&[3.0, 5.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn f_statistic_matches_hand_computation() {
        let x = array![[1.0], [2.0], [3.0], [5.0], [6.0], [7.0]];
        let y = [0, 0, 0, 1, 1, 1];
        // between = 3*(2-4)^2 + 3*(6-4)^2 = 24; within = 4 over 4 dof.
        assert_relative_eq!(f_classif(&x, &y)[0], 24.0, epsilon = 1e-12);
    }

    #[test]
    fn select_k_best_keeps_informative_columns_in_order() {
        let x = array![
            [0.0, 1.0, 9.0, 0.1],
            [0.1, 1.1, 8.0, 0.2],
            [0.2, 0.9, 1.0, 0.9],
            [0.1, 1.0, 2.0, 1.0],
        ];
        let y = [0, 0, 1, 1];
        let selector = SelectKBest::fit(&x, &y, 2).unwrap();
        assert_eq!(selector.support(), &[2, 3]);
        assert_eq!(selector.transform(&x).ncols(), 2);
        assert_eq!(selector.transform_row(&[1.0, 2.0, 3.0, 4.0]), vec![3.0, 4.0]);
    }

    #[test]
    fn k_larger_than_width_is_rejected() {
        let x = array![[0.0, 1.0], [1.0, 0.0]];
        assert!(SelectKBest::fit(&x, &[0, 1], 3).is_err());
    }
}
