use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ForensicsError, Result},
    models::{ClassWeight, Explainable, sigmoid},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Penalty {
    L1,
    #[default]
    L2,
}

/// Minimizes `penalty(w) + C * sum_i s_i * logloss_i`; the intercept is not penalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    #[serde(rename = "C")]
    pub c: f64,
    pub penalty: Penalty,
    pub class_weight: ClassWeight,
    pub max_iter: usize,
    pub tol: f64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            penalty: Penalty::L2,
            class_weight: ClassWeight::Balanced,
            max_iter: 1000,
            tol: 1e-6,
        }
    }
}

impl LogisticParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(ForensicsError::InvalidConfig(format!("C must be positive, got {}", self.c)));
        }
        if self.max_iter == 0 {
            return Err(ForensicsError::InvalidConfig("max_iter must be positive".into()));
        }
        if !(self.tol > 0.0) {
            return Err(ForensicsError::InvalidConfig("tol must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticRegression {
    coef: Vec<f64>,
    intercept: f64,
}

fn softplus(z: f64) -> f64 {
    if z > 0.0 { z + (-z).exp().ln_1p() } else { z.exp().ln_1p() }
}

struct Problem<'a> {
    x: &'a Array2<f64>,
    y: Array1<f64>,
    weights: Array1<f64>,
}

impl Problem<'_> {
    fn margins(&self, w: &Array1<f64>, b: f64) -> Array1<f64> {
        self.x.dot(w) + b
    }

    /// Weighted log-loss of the data term only.
    fn loss(&self, w: &Array1<f64>, b: f64) -> f64 {
        self.margins(w, b)
            .iter()
            .zip(self.y.iter().zip(&self.weights))
            .map(|(&z, (&y, &s))| s * (softplus(z) - y * z))
            .sum()
    }

    fn residuals(&self, w: &Array1<f64>, b: f64) -> Array1<f64> {
        let p = self.margins(w, b).mapv(sigmoid);
        (p - &self.y) * &self.weights
    }

    fn gradient(&self, w: &Array1<f64>, b: f64) -> (Array1<f64>, f64) {
        let r = self.residuals(w, b);
        (self.x.t().dot(&r), r.sum())
    }
}

impl LogisticRegression {
    pub fn fit(x: &Array2<f64>, y: &[u8], params: &LogisticParams) -> Result<Self> {
        params.validate()?;
        if x.nrows() != y.len() || x.nrows() == 0 {
            return Err(ForensicsError::ModelFit(format!(
                "logistic fit needs matching non-empty inputs, got {} rows and {} labels",
                x.nrows(),
                y.len()
            )));
        }
        let problem = Problem {
            x,
            y: y.iter().map(|&v| f64::from(v)).collect(),
            weights: params
                .class_weight
                .sample_weights(y)
                .into_iter()
                .map(|s| s * params.c)
                .collect(),
        };

        let (w, b) = match params.penalty {
            Penalty::L2 => newton_l2(&problem, params.max_iter, params.tol)?,
            Penalty::L1 => fista_l1(&problem, params.max_iter, params.tol),
        };
        Ok(Self {
            coef: w.to_vec(),
            intercept: b,
        })
    }

    pub fn coef(&self) -> &[f64] {
        &self.coef
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn decision_function(&self, row: &[f64]) -> f64 {
        self.coef.iter().zip(row).map(|(w, v)| w * v).sum::<f64>() + self.intercept
    }

    pub fn predict_proba_row(&self, row: &[f64]) -> f64 {
        sigmoid(self.decision_function(row))
    }
}

impl Explainable for LogisticRegression {
    fn contribution(&self, sample: &[f64]) -> Vec<f64> {
        sample.iter().zip(&self.coef).map(|(v, w)| v * w).collect()
    }
}

/// Damped Newton iterations on the L2-regularized objective.
fn newton_l2(problem: &Problem<'_>, max_iter: usize, tol: f64) -> Result<(Array1<f64>, f64)> {
    let d = problem.x.ncols();
    let mut w = Array1::<f64>::zeros(d);
    let mut b = 0.0;
    let objective = |w: &Array1<f64>, b: f64| problem.loss(w, b) + 0.5 * w.dot(w);

    for iter in 0..max_iter {
        let (grad_loss, grad_b) = problem.gradient(&w, b);
        let grad_w = grad_loss + &w;
        let grad_norm = grad_w.iter().chain(std::iter::once(&grad_b)).fold(0.0f64, |m, g| m.max(g.abs()));
        if grad_norm < tol {
            log::trace!("newton converged after {} iterations", iter);
            break;
        }

        let p = problem.margins(&w, b).mapv(sigmoid);
        let h = &problem.weights * &p.mapv(|v| v * (1.0 - v));
        let xh = problem.x * &h.view().insert_axis(Axis(1));
        let xtx = problem.x.t().dot(&xh);
        let col = xh.sum_axis(Axis(0));

        let mut hessian = DMatrix::<f64>::zeros(d + 1, d + 1);
        for i in 0..d {
            for j in 0..d {
                hessian[(i, j)] = xtx[[i, j]];
            }
            hessian[(i, i)] += 1.0;
            hessian[(i, d)] = col[i];
            hessian[(d, i)] = col[i];
        }
        hessian[(d, d)] = h.sum() + 1e-10;

        let rhs = DVector::from_iterator(d + 1, grad_w.iter().copied().chain(std::iter::once(grad_b)));
        let step = match hessian.clone().cholesky() {
            Some(chol) => chol.solve(&rhs),
            None => hessian
                .lu()
                .solve(&rhs)
                .ok_or_else(|| ForensicsError::ModelFit("singular Hessian in logistic fit".into()))?,
        };

        let current = objective(&w, b);
        let decrease: f64 = rhs.dot(&step);
        let step_w = Array1::from_iter(step.iter().take(d).copied());
        let step_b = step[d];

        let mut scale = 1.0;
        loop {
            let cand_w = &w - &(&step_w * scale);
            let cand_b = b - step_b * scale;
            if objective(&cand_w, cand_b) <= current - 1e-4 * scale * decrease || scale < 1e-10 {
                w = cand_w;
                b = cand_b;
                break;
            }
            scale *= 0.5;
        }
    }

    Ok((w, b))
}

fn soft_threshold(v: f64, t: f64) -> f64 {
    if v > t {
        v - t
    } else if v < -t {
        v + t
    } else {
        0.0
    }
}

/// Accelerated proximal gradient with backtracking on the L1-regularized objective.
fn fista_l1(problem: &Problem<'_>, max_iter: usize, tol: f64) -> (Array1<f64>, f64) {
    let d = problem.x.ncols();
    let mut w = Array1::<f64>::zeros(d);
    let mut b = 0.0;
    let mut yw = w.clone();
    let mut yb = b;
    let mut t = 1.0f64;
    let mut lipschitz = 1e-3;

    for iter in 0..max_iter {
        let (gw, gb) = problem.gradient(&yw, yb);
        let base = problem.loss(&yw, yb);

        let (next_w, next_b) = loop {
            let step = 1.0 / lipschitz;
            let cand_w = (&yw - &(&gw * step)).mapv(|v| soft_threshold(v, step));
            let cand_b = yb - gb * step;
            let dw = &cand_w - &yw;
            let db = cand_b - yb;
            let quad = base + gw.dot(&dw) + gb * db + 0.5 * lipschitz * (dw.dot(&dw) + db * db);
            if problem.loss(&cand_w, cand_b) <= quad + 1e-12 || lipschitz > 1e12 {
                break (cand_w, cand_b);
            }
            lipschitz *= 2.0;
        };

        let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
        let momentum = (t - 1.0) / t_next;
        let delta_w = &next_w - &w;
        let delta_b = next_b - b;
        yw = &next_w + &(&delta_w * momentum);
        yb = next_b + delta_b * momentum;

        let change = delta_w.iter().fold(delta_b.abs(), |m, v| m.max(v.abs()));
        w = next_w;
        b = next_b;
        t = t_next;
        if change < tol {
            log::trace!("fista converged after {} iterations", iter);
            break;
        }
    }

    (w, b)
}
