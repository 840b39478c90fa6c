//! The quadratic kernel induced by a logit that is at most quadratic in
//! the (kappa-scaled) covariates.
//!
//! ```text
//! k(x, z) = ½η₂²(1 + x·z)² − ½η₂²(x²·z²) + (η₁² − η₂²) x·z + c² − ½η₂²
//! ```
//!
//! Everything is expressed through two pairwise statistics,
//! `s = x·z` and `q = x²·z²`, which is also what the model gradient needs.

use nalgebra::DMatrix;

pub const JITTER: f64 = 1.0e-6;

#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub eta1: f64,
    pub eta2: f64,
    pub c: f64,
}

impl KernelParams {
    fn eval(&self, s: f64, q: f64) -> f64 {
        let eta1sq = self.eta1 * self.eta1;
        let eta2sq = self.eta2 * self.eta2;
        let one_s = 1.0 + s;
        0.5 * eta2sq * one_s * one_s - 0.5 * eta2sq * q + (eta1sq - eta2sq) * s + self.c * self.c
            - 0.5 * eta2sq
    }

    /// ∂k/∂η₁ at fixed s, q.
    pub fn d_eta1(&self, s: f64) -> f64 {
        2.0 * self.eta1 * s
    }

    /// ∂k/∂η₂ at fixed s, q.
    pub fn d_eta2(&self, s: f64, q: f64) -> f64 {
        self.eta2 * (s * s - q)
    }

    /// ∂k/∂s
    pub fn d_s(&self, s: f64) -> f64 {
        self.eta2 * self.eta2 * s + self.eta1 * self.eta1
    }

    /// ∂k/∂q
    pub fn d_q(&self) -> f64 {
        -0.5 * self.eta2 * self.eta2
    }
}

/// Multiply column `p` of `x` by `kappa[p]`.
pub fn scale_columns(x: &DMatrix<f64>, kappa: &[f64]) -> DMatrix<f64> {
    debug_assert_eq!(x.ncols(), kappa.len());
    let mut out = x.clone();
    for (p, mut col) in out.column_iter_mut().enumerate() {
        col *= kappa[p];
    }
    out
}

/// Pairwise statistics between the rows of two scaled point sets.
#[derive(Debug, Clone)]
pub struct KernelStats {
    /// s_ij = Σ_p a_ip b_jp
    pub s: DMatrix<f64>,
    /// q_ij = Σ_p a_ip² b_jp²
    pub q: DMatrix<f64>,
}

impl KernelStats {
    pub fn new(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Self {
        let s = a * b.transpose();
        let a2 = a.component_mul(a);
        let b2 = b.component_mul(b);
        let q = a2 * b2.transpose();
        Self { s, q }
    }

    pub fn kernel(&self, params: &KernelParams) -> DMatrix<f64> {
        self.s.zip_map(&self.q, |s, q| params.eval(s, q))
    }
}

/// Kernel between two different point sets.
pub fn cross(a: &DMatrix<f64>, b: &DMatrix<f64>, params: &KernelParams) -> DMatrix<f64> {
    KernelStats::new(a, b).kernel(params)
}

/// Gram matrix of a point set with itself, jittered on the diagonal.
pub fn gram(a: &DMatrix<f64>, params: &KernelParams) -> DMatrix<f64> {
    let mut k = cross(a, a, params);
    add_jitter(&mut k);
    k
}

pub fn add_jitter(k: &mut DMatrix<f64>) {
    for i in 0..k.nrows().min(k.ncols()) {
        k[(i, i)] += JITTER;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn naive(x: &[f64], z: &[f64], p: &KernelParams) -> f64 {
        let dot: f64 = x.iter().zip(z).map(|(a, b)| a * b).sum();
        let dot2: f64 = x.iter().zip(z).map(|(a, b)| a * a * b * b).sum();
        let e1 = p.eta1 * p.eta1;
        let e2 = p.eta2 * p.eta2;
        0.5 * e2 * (1.0 + dot).powi(2) - 0.5 * e2 * dot2 + (e1 - e2) * dot + p.c * p.c - 0.5 * e2
    }

    #[test]
    fn cross_matches_naive_formula() {
        let params = KernelParams {
            eta1: 0.8,
            eta2: 0.3,
            c: 1.0,
        };
        let a = DMatrix::from_row_slice(2, 3, &[0.5, -1.0, 0.2, 1.1, 0.3, -0.7]);
        let b = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, -0.4, 0.9, 1.2, 0.6, -0.6, 0.1]);
        let k = cross(&a, &b, &params);
        assert_eq!(k.shape(), (2, 3));
        for i in 0..2 {
            for j in 0..3 {
                let xi: Vec<f64> = a.row(i).iter().copied().collect();
                let zj: Vec<f64> = b.row(j).iter().copied().collect();
                assert_abs_diff_eq!(k[(i, j)], naive(&xi, &zj, &params), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn gram_is_symmetric_and_jittered() {
        let params = KernelParams {
            eta1: 1.2,
            eta2: 0.5,
            c: 1.0,
        };
        let a = DMatrix::from_row_slice(3, 2, &[0.5, -1.0, 1.1, 0.3, -0.7, 0.9]);
        let g = gram(&a, &params);
        let raw = cross(&a, &a, &params);
        for i in 0..3 {
            assert_abs_diff_eq!(g[(i, i)] - raw[(i, i)], JITTER, epsilon = 1e-15);
            for j in 0..3 {
                assert_abs_diff_eq!(g[(i, j)], g[(j, i)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn partials_match_finite_difference() {
        let p = KernelParams {
            eta1: 0.9,
            eta2: 0.4,
            c: 1.0,
        };
        let (s, q) = (0.7, 0.2);
        let eps = 1e-6;
        let fd = |f: &dyn Fn(f64) -> f64| (f(eps) - f(-eps)) / (2.0 * eps);

        let d1 = fd(&|h| KernelParams { eta1: p.eta1 + h, ..p }.eval(s, q));
        let d2 = fd(&|h| KernelParams { eta2: p.eta2 + h, ..p }.eval(s, q));
        let ds = fd(&|h| p.eval(s + h, q));
        let dq = fd(&|h| p.eval(s, q + h));

        assert_abs_diff_eq!(p.d_eta1(s), d1, epsilon = 1e-7);
        assert_abs_diff_eq!(p.d_eta2(s, q), d2, epsilon = 1e-7);
        assert_abs_diff_eq!(p.d_s(s), ds, epsilon = 1e-7);
        assert_abs_diff_eq!(p.d_q(), dq, epsilon = 1e-7);
    }

    #[test]
    fn scaling_multiplies_columns() {
        let x = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let sx = scale_columns(&x, &[0.5, 2.0]);
        assert_eq!(sx, DMatrix::from_row_slice(2, 2, &[0.5, 4.0, 1.5, 8.0]));
    }
}
