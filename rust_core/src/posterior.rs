//! Posterior marginals of the effective regression coefficients.
//!
//! For a fixed draw of the kernel hyperparameters and `omega`, the latent
//! function is Gaussian, so any linear functional of it is Gaussian too.
//! Main effects `theta_i` and interactions `theta_ij` are such functionals:
//! finite differences of f evaluated at a handful of probe points. Pooled
//! over draws, each coefficient is a mixture of Gaussians, summarised by
//! its mean and standard deviation.

use crate::data::Dataset;
use crate::error::{Result, SlogError};
use crate::kernel::{cross, gram, scale_columns, KernelParams};
use crate::model::Draw;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rayon::prelude::*;
use serde::Serialize;

/// Mean and standard deviation of one coefficient across the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoefficientSummary {
    pub mean: f64,
    pub std: f64,
}

impl CoefficientSummary {
    /// A coefficient is inactive when `mean ± 2·std` straddles zero.
    pub fn is_active(&self) -> bool {
        let lower = self.mean - 2.0 * self.std;
        let upper = self.mean + 2.0 * self.std;
        !(lower < 0.0 && upper > 0.0)
    }
}

/// Probe rows and the weights that turn f at those rows into a coefficient.
struct Probe {
    rows: DMatrix<f64>,
    weights: DVector<f64>,
}

impl Probe {
    /// theta_i = ½ (f(e_i) − f(−e_i))
    fn singleton(num_dimensions: usize, dim: usize) -> Self {
        let mut rows = DMatrix::zeros(2, num_dimensions);
        rows[(0, dim)] = 1.0;
        rows[(1, dim)] = -1.0;
        Self {
            rows,
            weights: DVector::from_vec(vec![0.5, -0.5]),
        }
    }

    /// theta_ij = ¼ (f(+,+) − f(+,−) − f(−,+) + f(−,−))
    fn pairwise(num_dimensions: usize, dim1: usize, dim2: usize) -> Self {
        let mut rows = DMatrix::zeros(4, num_dimensions);
        for (r, (s1, s2)) in [(1.0, 1.0), (1.0, -1.0), (-1.0, 1.0), (-1.0, -1.0)]
            .into_iter()
            .enumerate()
        {
            rows[(r, dim1)] = s1;
            rows[(r, dim2)] = s2;
        }
        Self {
            rows,
            weights: DVector::from_vec(vec![0.25, -0.25, -0.25, 0.25]),
        }
    }
}

/// The per-draw pieces shared by every probe: one Cholesky factor of
/// `K + diag(1/omega)` and the posterior mean weights.
pub struct CoefficientPosterior {
    kx: DMatrix<f64>,
    kappa: Vec<f64>,
    params: KernelParams,
    chol: Cholesky<f64, Dyn>,
    /// ½ (K + diag(1/ω))⁻¹ (y / ω)
    mean_weights: DVector<f64>,
}

impl CoefficientPosterior {
    pub fn new(dataset: &Dataset, draw: &Draw, c: f64) -> Result<Self> {
        let n = dataset.num_data();
        if draw.omega.len() != n {
            return Err(SlogError::DimensionMismatch {
                what: "omega",
                expected: n,
                got: draw.omega.len(),
            });
        }
        if draw.kappa.len() != dataset.num_dimensions() {
            return Err(SlogError::DimensionMismatch {
                what: "kappa",
                expected: dataset.num_dimensions(),
                got: draw.kappa.len(),
            });
        }

        let params = draw.kernel_params(c);
        let kx = scale_columns(&dataset.x, &draw.kappa);
        let mut a = gram(&kx, &params);
        for (i, &w) in draw.omega.iter().enumerate() {
            a[(i, i)] += 1.0 / w;
        }
        let chol = a
            .cholesky()
            .ok_or(SlogError::NotPositiveDefinite("K + diag(1/omega)"))?;

        let y_over_omega =
            DVector::from_iterator(n, dataset.y.iter().zip(&draw.omega).map(|(y, w)| y / w));
        let mean_weights = chol.solve(&y_over_omega) * 0.5;

        Ok(Self {
            kx,
            kappa: draw.kappa.clone(),
            params,
            chol,
            mean_weights,
        })
    }

    fn evaluate(&self, probe: &Probe) -> (f64, f64) {
        let kprobe = scale_columns(&probe.rows, &self.kappa);
        let k_probe_x = cross(&kprobe, &self.kx, &self.params);
        let k_probe_probe = gram(&kprobe, &self.params);

        let mean = probe.weights.dot(&(&k_probe_x * &self.mean_weights));

        // l_dirty keeps garbage above the diagonal; the lower solve never reads it.
        let mut linv_kxp = k_probe_x.transpose();
        let solved = self.chol.l_dirty().solve_lower_triangular_mut(&mut linv_kxp);
        debug_assert!(solved);
        let cov = k_probe_probe - linv_kxp.transpose() * &linv_kxp;
        let var = probe.weights.dot(&(&cov * &probe.weights));
        (mean, var)
    }

    /// Mean and variance of theta_dim under this draw.
    pub fn singleton(&self, dim: usize) -> (f64, f64) {
        self.evaluate(&Probe::singleton(self.kappa.len(), dim))
    }

    /// Mean and variance of theta_{dim1, dim2} under this draw.
    pub fn pairwise(&self, dim1: usize, dim2: usize) -> (f64, f64) {
        self.evaluate(&Probe::pairwise(self.kappa.len(), dim1, dim2))
    }
}

/// Mean and variance of an equally weighted mixture of Gaussians.
pub fn gaussian_mixture_stats(mus: &[f64], variances: &[f64]) -> (f64, f64) {
    let n = mus.len() as f64;
    let mean_mu = mus.iter().sum::<f64>() / n;
    let mean_var = variances.iter().sum::<f64>() / variances.len() as f64;
    let mean_sq = mus.iter().map(|m| m * m).sum::<f64>() / n;
    (mean_mu, mean_var + mean_sq - mean_mu * mean_mu)
}

fn summarize(mus: &[f64], variances: &[f64]) -> CoefficientSummary {
    let (mean, var) = gaussian_mixture_stats(mus, variances);
    CoefficientSummary {
        mean,
        std: var.max(0.0).sqrt(),
    }
}

/// Evaluate `per_draw` on every draw in parallel and pool the resulting
/// (mean, variance) rows into one summary per column.
fn pool_over_draws<F>(
    dataset: &Dataset,
    draws: &[Draw],
    c: f64,
    num_outputs: usize,
    per_draw: F,
) -> Result<Vec<CoefficientSummary>>
where
    F: Fn(&CoefficientPosterior) -> Vec<(f64, f64)> + Sync,
{
    if draws.is_empty() {
        return Err(SlogError::InvalidConfig(
            "no posterior draws to summarise".into(),
        ));
    }

    let rows: Vec<Vec<(f64, f64)>> = draws
        .par_iter()
        .map(|draw| CoefficientPosterior::new(dataset, draw, c).map(|post| per_draw(&post)))
        .collect::<Result<_>>()?;

    Ok((0..num_outputs)
        .map(|k| {
            let mus: Vec<f64> = rows.iter().map(|r| r[k].0).collect();
            let vars: Vec<f64> = rows.iter().map(|r| r[k].1).collect();
            summarize(&mus, &vars)
        })
        .collect())
}

/// Posterior summary of theta_i for every input dimension.
pub fn analyze_dimensions(
    dataset: &Dataset,
    draws: &[Draw],
    c: f64,
) -> Result<Vec<CoefficientSummary>> {
    let p = dataset.num_dimensions();
    pool_over_draws(dataset, draws, c, p, |post| {
        (0..p).map(|dim| post.singleton(dim)).collect()
    })
}

/// Posterior summary of theta_ij for each requested pair (i ≠ j).
pub fn analyze_pairs(
    dataset: &Dataset,
    draws: &[Draw],
    c: f64,
    pairs: &[(usize, usize)],
) -> Result<Vec<CoefficientSummary>> {
    let p = dataset.num_dimensions();
    for &(i, j) in pairs {
        if i == j || i >= p || j >= p {
            return Err(SlogError::InvalidConfig(format!(
                "pair ({}, {}) must name two distinct dimensions below {}",
                i, j, p
            )));
        }
    }
    if pairs.is_empty() {
        return Ok(Vec::new());
    }
    pool_over_draws(dataset, draws, c, pairs.len(), |post| {
        pairs.iter().map(|&(i, j)| post.pairwise(i, j)).collect()
    })
}
