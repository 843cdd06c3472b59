//! Paired-sample hypothesis tests on difference vectors.

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

use crate::{
    error::{ForensicsError, Result},
    evaluation::metrics::average_ranks,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOutcome {
    pub statistic: f64,
    pub p_value: f64,
}

fn poly(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| ForensicsError::AnalysisFailed(e.to_string()))
}

/// Shapiro-Wilk W test (Royston's approximation, valid for 3 <= n <= 5000).
///
/// A sample with zero range is reported as W = 1, p = 1.
pub fn shapiro_wilk(sample: &[f64]) -> Result<TestOutcome> {
    const C1: [f64; 6] = [0.0, 0.221157, -0.147981, -2.07119, 4.434685, -2.706056];
    const C2: [f64; 6] = [0.0, 0.042981, -0.293762, -1.752461, 5.682633, -3.582633];
    const G: [f64; 2] = [-2.273, 0.459];
    const C3: [f64; 4] = [0.544, -0.39978, 0.025054, -6.714e-4];
    const C4: [f64; 4] = [1.3822, -0.77857, 0.062767, -0.0020322];
    const C5: [f64; 4] = [-1.5861, -0.31082, -0.083751, 0.0038915];
    const C6: [f64; 3] = [-0.4803, -0.082676, 0.0030302];

    let n = sample.len();
    if n < 3 {
        return Err(ForensicsError::InvalidParameter(format!(
            "Shapiro-Wilk needs at least 3 observations, got {n}"
        )));
    }
    let mut x = sample.to_vec();
    x.sort_by(|a, b| a.total_cmp(b));
    let range = x[n - 1] - x[0];
    if range < 1e-19 {
        return Ok(TestOutcome {
            statistic: 1.0,
            p_value: 1.0,
        });
    }

    let normal = standard_normal()?;
    let an = n as f64;
    let half = n / 2;

    // Coefficient magnitudes from the extremes inwards.
    let mut a = vec![0.0; half];
    if n == 3 {
        a[0] = std::f64::consts::FRAC_1_SQRT_2;
    } else {
        let m: Vec<f64> = (1..=half)
            .map(|i| -normal.inverse_cdf((i as f64 - 0.375) / (an + 0.25)))
            .collect();
        let summ2 = 2.0 * m.iter().map(|v| v * v).sum::<f64>();
        let ssumm2 = summ2.sqrt();
        let rsn = 1.0 / an.sqrt();
        let a1 = poly(&C1, rsn) + m[0] / ssumm2;

        let (first_free, fac) = if n > 5 {
            let a2 = m[1] / ssumm2 + poly(&C2, rsn);
            a[1] = a2;
            let fac = ((summ2 - 2.0 * m[0] * m[0] - 2.0 * m[1] * m[1])
                / (1.0 - 2.0 * a1 * a1 - 2.0 * a2 * a2))
                .sqrt();
            (2, fac)
        } else {
            let fac = ((summ2 - 2.0 * m[0] * m[0]) / (1.0 - 2.0 * a1 * a1)).sqrt();
            (1, fac)
        };
        a[0] = a1;
        for i in first_free..half {
            a[i] = m[i] / fac;
        }
    }

    let coefficients: Vec<f64> = (0..n)
        .map(|i| {
            let mirror = n - 1 - i;
            if i < mirror {
                -a[i]
            } else if i > mirror {
                a[mirror]
            } else {
                0.0
            }
        })
        .collect();

    let x_mean = x.iter().sum::<f64>() / an;
    let a_mean = coefficients.iter().sum::<f64>() / an;
    let (mut ssa, mut ssx, mut sax) = (0.0, 0.0, 0.0);
    for (xi, ai) in x.iter().zip(&coefficients) {
        let dx = (xi - x_mean) / range;
        let da = ai - a_mean;
        ssa += da * da;
        ssx += dx * dx;
        sax += da * dx;
    }
    let w = (sax * sax / (ssa * ssx)).min(1.0);
    let w1 = 1.0 - w;

    if n == 3 {
        let p = 1.90985931710274 * (w.sqrt().asin() - 1.04719755119660);
        return Ok(TestOutcome {
            statistic: w,
            p_value: p.max(0.0),
        });
    }

    let mut y = w1.ln();
    let (mean, sd) = if n <= 11 {
        let gamma = poly(&G, an);
        if y >= gamma {
            return Ok(TestOutcome {
                statistic: w,
                p_value: 1e-99,
            });
        }
        y = -(gamma - y).ln();
        (poly(&C3, an), poly(&C4, an).exp())
    } else {
        let ln_n = an.ln();
        (poly(&C5, ln_n), poly(&C6, ln_n).exp())
    };

    Ok(TestOutcome {
        statistic: w,
        p_value: normal.sf((y - mean) / sd),
    })
}

/// Two-sided Wilcoxon signed-rank test on paired differences.
///
/// Zero differences are discarded. The exact null distribution is used for
/// up to 50 differences when no zeros or ties occur; otherwise the normal
/// approximation with tie correction (no continuity correction).
pub fn wilcoxon_signed_rank(differences: &[f64]) -> Result<TestOutcome> {
    let had_zeros = differences.iter().any(|&d| d == 0.0);
    let nonzero: Vec<f64> = differences.iter().copied().filter(|&d| d != 0.0).collect();
    let n = nonzero.len();
    if n == 0 {
        return Ok(TestOutcome {
            statistic: 0.0,
            p_value: 1.0,
        });
    }

    let magnitudes: Vec<f64> = nonzero.iter().map(|d| d.abs()).collect();
    let ranks = average_ranks(&magnitudes);
    let r_plus: f64 = ranks
        .iter()
        .zip(&nonzero)
        .filter(|(_, d)| **d > 0.0)
        .map(|(r, _)| r)
        .sum();
    let total = (n * (n + 1)) as f64 / 2.0;
    let r_minus = total - r_plus;
    let statistic = r_plus.min(r_minus);

    let tie_groups = tie_group_sizes(&magnitudes);
    let has_ties = tie_groups.iter().any(|&t| t > 1);

    let p_value = if n <= 50 && !had_zeros && !has_ties {
        exact_signed_rank_p(n, r_plus)
    } else {
        let mean = n as f64 * (n as f64 + 1.0) / 4.0;
        let mut variance = n as f64 * (n as f64 + 1.0) * (2.0 * n as f64 + 1.0) / 24.0;
        variance -= tie_groups
            .iter()
            .map(|&t| {
                let t = t as f64;
                t * t * t - t
            })
            .sum::<f64>()
            / 48.0;
        if variance <= 0.0 {
            1.0
        } else {
            let z = (statistic - mean) / variance.sqrt();
            (2.0 * standard_normal()?.sf(z.abs())).min(1.0)
        }
    };

    Ok(TestOutcome { statistic, p_value })
}

fn tie_group_sizes(values: &[f64]) -> Vec<usize> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut groups = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        groups.push(j - i);
        i = j;
    }
    groups
}

/// Two-sided p-value of R+ under the exact null with untied ranks 1..=n.
fn exact_signed_rank_p(n: usize, r_plus: f64) -> f64 {
    let max_sum = n * (n + 1) / 2;
    let mut counts = vec![0.0_f64; max_sum + 1];
    counts[0] = 1.0;
    for rank in 1..=n {
        for s in (rank..=max_sum).rev() {
            counts[s] += counts[s - rank];
        }
    }
    let total: f64 = counts.iter().sum();
    let r = r_plus.round() as usize;

    let p = if r_plus > max_sum as f64 / 2.0 {
        counts[r..].iter().sum::<f64>() / total
    } else {
        counts[..=r].iter().sum::<f64>() / total
    };
    (2.0 * p).min(1.0)
}

/// Paired Student t test on a difference vector.
///
/// With zero spread the statistic is 0 (p = 1) when the mean is 0 and
/// infinite (p = 0) otherwise.
pub fn paired_t_test(differences: &[f64]) -> Result<TestOutcome> {
    let n = differences.len();
    if n < 2 {
        return Err(ForensicsError::InvalidParameter(
            "paired t test needs at least 2 pairs".into(),
        ));
    }
    let mean = differences.iter().sum::<f64>() / n as f64;
    let sd = sample_std(differences);
    if sd < 1e-12 {
        return Ok(if mean == 0.0 {
            TestOutcome {
                statistic: 0.0,
                p_value: 1.0,
            }
        } else {
            TestOutcome {
                statistic: mean.signum() * f64::INFINITY,
                p_value: 0.0,
            }
        });
    }

    let t = mean / (sd / (n as f64).sqrt());
    let dist = StudentsT::new(0.0, 1.0, (n - 1) as f64)
        .map_err(|e| ForensicsError::AnalysisFailed(e.to_string()))?;
    Ok(TestOutcome {
        statistic: t,
        p_value: (2.0 * dist.sf(t.abs())).min(1.0),
    })
}

pub fn sample_std(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
}
