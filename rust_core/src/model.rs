//! Sparse quadratic-kernel GP with a logit link, written directly as a
//! log-density over an unconstrained parameter vector.
//!
//! Latent sites and their unconstrained layout:
//!
//! | index            | site            | support   |
//! |------------------|-----------------|-----------|
//! | 0                | eta1            | (0, ∞)    |
//! | 1                | msq             | (0, ∞)    |
//! | 2                | xisq            | (0, ∞)    |
//! | 3 .. 3+P         | lambda[p]       | (0, ∞)    |
//! | 3+P .. 3+P+N     | omega[n]        | (0, 2.5)  |
//!
//! The likelihood integrates the latent function out against the
//! Pólya-Gamma auxiliaries `omega`, which leaves a Gaussian marginal over
//! `K + diag(1/omega)`. The gradient is derived by hand through the
//! Cholesky solve; see `log_density_and_grad`.

use crate::distributions::{HalfCauchy, InverseGamma, ParamTransform, TruncatedPolyaGamma};
use crate::data::Dataset;
use crate::error::{Result, SlogError};
use crate::kernel::{add_jitter, scale_columns, KernelParams, KernelStats};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::trace;

const ETA1: usize = 0;
const MSQ: usize = 1;
const XISQ: usize = 2;
const LAMBDA_START: usize = 3;

/// Anything the sampler can explore: a differentiable log-density on ℝᵈ.
///
/// Implementations return `-inf` for points where the density cannot be
/// evaluated; the sampler treats those as divergent.
pub trait LogDensity: Sync {
    fn dim(&self) -> usize;

    /// Write ∇ log p(q) into `grad` and return log p(q).
    fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64;
}

/// Prior hyperparameters of the sparsity-inducing construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub expected_sparsity: usize,
    pub alpha1: f64,
    pub beta1: f64,
    pub sigma: f64,
    pub alpha2: f64,
    pub beta2: f64,
    pub c: f64,
}

impl Hyperparameters {
    pub fn for_sparsity(expected_sparsity: usize) -> Self {
        Self {
            expected_sparsity,
            alpha1: 2.0,
            beta1: 1.0,
            sigma: 2.0,
            alpha2: 2.0,
            beta2: 1.0,
            c: 1.0,
        }
    }

    pub fn validate(&self, num_dimensions: usize) -> Result<()> {
        if self.expected_sparsity == 0 || self.expected_sparsity >= num_dimensions {
            return Err(SlogError::InvalidConfig(format!(
                "expected_sparsity must lie in 1..{}, got {}",
                num_dimensions, self.expected_sparsity
            )));
        }
        let positive = [
            ("alpha1", self.alpha1),
            ("beta1", self.beta1),
            ("sigma", self.sigma),
            ("alpha2", self.alpha2),
            ("beta2", self.beta2),
        ];
        for (name, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(SlogError::InvalidConfig(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        if !self.c.is_finite() {
            return Err(SlogError::InvalidConfig(format!("c must be finite, got {}", self.c)));
        }
        Ok(())
    }

    /// Global scale of the HalfCauchy prior on eta1.
    pub fn phi(&self, num_data: usize, num_dimensions: usize) -> f64 {
        let s = self.expected_sparsity as f64;
        self.sigma * (s / (num_data as f64).sqrt()) / (num_dimensions as f64 - s)
    }
}

/// One posterior draw mapped back to every named site.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub eta1: f64,
    pub msq: f64,
    pub xisq: f64,
    pub eta2: f64,
    pub lambda: Vec<f64>,
    pub kappa: Vec<f64>,
    pub omega: Vec<f64>,
}

impl Draw {
    pub fn kernel_params(&self, c: f64) -> KernelParams {
        KernelParams {
            eta1: self.eta1,
            eta2: self.eta2,
            c,
        }
    }

    /// Names matching `flatten`: sample sites first, then deterministic ones.
    pub fn site_names(num_dimensions: usize, num_data: usize) -> Vec<String> {
        let mut names = vec!["eta1".to_string(), "msq".to_string(), "xisq".to_string()];
        names.extend((0..num_dimensions).map(|p| format!("lambda[{}]", p)));
        names.extend((0..num_data).map(|n| format!("omega[{}]", n)));
        names.push("eta2".to_string());
        names.extend((0..num_dimensions).map(|p| format!("kappa[{}]", p)));
        names
    }

    pub fn flatten(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(4 + 2 * self.lambda.len() + self.omega.len());
        out.extend([self.eta1, self.msq, self.xisq]);
        out.extend_from_slice(&self.lambda);
        out.extend_from_slice(&self.omega);
        out.push(self.eta2);
        out.extend_from_slice(&self.kappa);
        out
    }
}

fn eta2_of(eta1: f64, msq: f64, xisq: f64) -> f64 {
    eta1 * eta1 * xisq.sqrt() / msq
}

fn kappa_of(eta1: f64, msq: f64, lambda: f64) -> f64 {
    msq.sqrt() * lambda / (msq + (eta1 * lambda).powi(2)).sqrt()
}

#[derive(Debug, Clone)]
pub struct SparseQuadraticModel {
    x: DMatrix<f64>,
    x_sq: DMatrix<f64>,
    y: DVector<f64>,
    hypers: Hyperparameters,
    eta1_prior: HalfCauchy,
    msq_prior: InverseGamma,
    xisq_prior: InverseGamma,
    lambda_prior: HalfCauchy,
    omega_prior: TruncatedPolyaGamma,
}

impl SparseQuadraticModel {
    pub fn new(dataset: &Dataset, hypers: Hyperparameters) -> Result<Self> {
        let (n, p) = dataset.x.shape();
        if dataset.y.len() != n {
            return Err(SlogError::DimensionMismatch {
                what: "labels",
                expected: n,
                got: dataset.y.len(),
            });
        }
        hypers.validate(p)?;

        Ok(Self {
            x: dataset.x.clone(),
            x_sq: dataset.x.component_mul(&dataset.x),
            y: dataset.y.clone(),
            hypers,
            eta1_prior: HalfCauchy::new(hypers.phi(n, p)),
            msq_prior: InverseGamma::new(hypers.alpha1, hypers.beta1),
            xisq_prior: InverseGamma::new(hypers.alpha2, hypers.beta2),
            lambda_prior: HalfCauchy::new(1.0),
            omega_prior: TruncatedPolyaGamma,
        })
    }

    pub fn num_data(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_dimensions(&self) -> usize {
        self.x.ncols()
    }

    pub fn hypers(&self) -> &Hyperparameters {
        &self.hypers
    }

    fn omega_start(&self) -> usize {
        LAMBDA_START + self.num_dimensions()
    }

    fn transform_at(&self, idx: usize) -> ParamTransform {
        if idx >= self.omega_start() {
            TruncatedPolyaGamma::transform()
        } else {
            ParamTransform::Exp
        }
    }

    /// Map an unconstrained vector onto every site.
    pub fn constrain(&self, q: &[f64]) -> Draw {
        let p = self.num_dimensions();
        let omega_start = self.omega_start();
        let exp = ParamTransform::Exp;

        let eta1 = exp.forward(q[ETA1]);
        let msq = exp.forward(q[MSQ]);
        let xisq = exp.forward(q[XISQ]);
        let lambda: Vec<f64> = q[LAMBDA_START..omega_start]
            .iter()
            .map(|&u| exp.forward(u))
            .collect();
        let omega_t = TruncatedPolyaGamma::transform();
        let omega: Vec<f64> = q[omega_start..].iter().map(|&u| omega_t.forward(u)).collect();
        let kappa = lambda.iter().map(|&l| kappa_of(eta1, msq, l)).collect();
        debug_assert_eq!(lambda.len(), p);

        Draw {
            eta1,
            msq,
            xisq,
            eta2: eta2_of(eta1, msq, xisq),
            lambda,
            kappa,
            omega,
        }
    }

    /// Inverse of `constrain` on the sample sites.
    pub fn unconstrain(&self, draw: &Draw) -> Vec<f64> {
        let exp = ParamTransform::Exp;
        let omega_t = TruncatedPolyaGamma::transform();
        let mut q = Vec::with_capacity(self.dim());
        q.extend([
            exp.inverse(draw.eta1),
            exp.inverse(draw.msq),
            exp.inverse(draw.xisq),
        ]);
        q.extend(draw.lambda.iter().map(|&l| exp.inverse(l)));
        q.extend(draw.omega.iter().map(|&w| omega_t.inverse(w)));
        q
    }

    pub fn log_density(&self, q: &[f64]) -> Result<f64> {
        let mut scratch = vec![0.0; self.dim()];
        self.log_density_and_grad(q, &mut scratch)
    }

    /// Joint log-density in unconstrained space and its exact gradient.
    ///
    /// With `A = K + diag(1/ω)`, `v = K y` and `α = A⁻¹ v` the observation
    /// factor is `⅛(yᵀv − vᵀα) − ½ log|A| − ½ Σ log ω`. Its differential is
    /// `tr(G dK) + Σₙ (⅛αₙ² − ½A⁻¹ₙₙ) d(1/ωₙ) − ½ Σ dωₙ/ωₙ` with
    /// `G = ⅛(y − α)(y − α)ᵀ − ½A⁻¹`.
    pub fn log_density_and_grad(&self, q: &[f64], grad: &mut [f64]) -> Result<f64> {
        let dim = self.dim();
        if q.len() != dim {
            return Err(SlogError::DimensionMismatch {
                what: "position",
                expected: dim,
                got: q.len(),
            });
        }
        if grad.len() != dim {
            return Err(SlogError::DimensionMismatch {
                what: "gradient",
                expected: dim,
                got: grad.len(),
            });
        }

        let n = self.num_data();
        let p = self.num_dimensions();
        let omega_start = self.omega_start();
        let draw = self.constrain(q);
        let Draw {
            eta1,
            msq,
            xisq,
            eta2,
            ref lambda,
            ref kappa,
            ref omega,
        } = draw;

        // ── priors, gradients w.r.t. constrained values ──
        let mut logp = self.eta1_prior.log_prob(eta1)
            + self.msq_prior.log_prob(msq)
            + self.xisq_prior.log_prob(xisq);
        let mut g_eta1 = self.eta1_prior.dlog_prob(eta1);
        let mut g_msq = self.msq_prior.dlog_prob(msq);
        let mut g_xisq = self.xisq_prior.dlog_prob(xisq);

        let mut g_lambda = vec![0.0; p];
        for (g, &l) in g_lambda.iter_mut().zip(lambda) {
            logp += self.lambda_prior.log_prob(l);
            *g = self.lambda_prior.dlog_prob(l);
        }

        let mut g_omega = vec![0.0; n];
        for (g, &w) in g_omega.iter_mut().zip(omega) {
            let (lp, dlp) = self.omega_prior.log_prob_and_grad(w);
            logp += lp;
            *g = dlp;
        }

        // ── observation factor ──
        let params = draw.kernel_params(self.hypers.c);
        let kx = scale_columns(&self.x, kappa);
        let stats = KernelStats::new(&kx, &kx);
        let mut k = stats.kernel(&params);
        add_jitter(&mut k);

        let mut a = k.clone();
        for (i, &w) in omega.iter().enumerate() {
            a[(i, i)] += 1.0 / w;
        }
        let chol = a
            .cholesky()
            .ok_or(SlogError::NotPositiveDefinite("K + diag(1/omega)"))?;

        let v = &k * &self.y;
        let alpha = chol.solve(&v);
        let half_log_det: f64 = chol.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
        let sum_log_omega: f64 = omega.iter().map(|w| w.ln()).sum();

        logp += 0.125 * (self.y.dot(&v) - v.dot(&alpha)) - half_log_det - 0.5 * sum_log_omega;

        // ── gradient of the observation factor ──
        let a_inv = chol.inverse();
        let r = &self.y - &alpha;
        let g_mat = (&r * r.transpose()) * 0.125 - &a_inv * 0.5;

        let mut g_eta1_k = 0.0;
        let mut g_eta2_k = 0.0;
        let mut h = DMatrix::<f64>::zeros(n, n);
        for j in 0..n {
            for i in 0..n {
                let gij = g_mat[(i, j)];
                let s = stats.s[(i, j)];
                let qv = stats.q[(i, j)];
                g_eta1_k += gij * params.d_eta1(s);
                g_eta2_k += gij * params.d_eta2(s, qv);
                h[(i, j)] = gij * params.d_s(s);
            }
        }

        // ∂s_ij/∂κ_p = 2κ_p x_ip x_jp,  ∂q_ij/∂κ_p = 4κ_p³ x_ip² x_jp²
        let hx = &h * &self.x;
        let gx2 = &g_mat * &self.x_sq;
        let d_q = params.d_q();
        let g_kappa: Vec<f64> = (0..p)
            .map(|col| {
                let kp = kappa[col];
                let lin = self.x.column(col).dot(&hx.column(col));
                let quad = self.x_sq.column(col).dot(&gx2.column(col));
                2.0 * kp * lin + 4.0 * d_q * kp.powi(3) * quad
            })
            .collect();

        for (i, &w) in omega.iter().enumerate() {
            let d_inv = 0.125 * alpha[i] * alpha[i] - 0.5 * a_inv[(i, i)];
            g_omega[i] += -d_inv / (w * w) - 0.5 / w;
        }

        // ── chain rule through eta2 and kappa ──
        let sqrt_msq = msq.sqrt();
        g_eta1 += g_eta1_k + g_eta2_k * 2.0 * eta1 * xisq.sqrt() / msq;
        g_msq += -g_eta2_k * eta2 / msq;
        g_xisq += g_eta2_k * eta2 / (2.0 * xisq);
        for col in 0..p {
            let l = lambda[col];
            let denom = (msq + (eta1 * l).powi(2)).powf(1.5);
            let dk_dlambda = msq * sqrt_msq / denom;
            let dk_deta1 = -sqrt_msq * eta1 * l.powi(3) / denom;
            let dk_dmsq = 0.5 * l.powi(3) * eta1 * eta1 / (sqrt_msq * denom);
            g_lambda[col] += g_kappa[col] * dk_dlambda;
            g_eta1 += g_kappa[col] * dk_deta1;
            g_msq += g_kappa[col] * dk_dmsq;
        }

        // ── back to unconstrained coordinates ──
        let constrained_grads = [g_eta1, g_msq, g_xisq]
            .into_iter()
            .chain(g_lambda)
            .chain(g_omega);
        for (idx, g_x) in constrained_grads.enumerate() {
            let t = self.transform_at(idx);
            let u = q[idx];
            logp += t.log_jacobian(u);
            grad[idx] = g_x * t.dx_du(u) + t.d_log_jacobian_du(u);
        }
        debug_assert!(omega_start + n == dim);

        Ok(logp)
    }
}

impl LogDensity for SparseQuadraticModel {
    fn dim(&self) -> usize {
        LAMBDA_START + self.num_dimensions() + self.num_data()
    }

    fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64 {
        match self.log_density_and_grad(q, grad) {
            Ok(logp) if logp.is_finite() && grad.iter().all(|g| g.is_finite()) => logp,
            Ok(_) => f64::NEG_INFINITY,
            Err(e) => {
                trace!(error = %e, "log-density evaluation failed");
                f64::NEG_INFINITY
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::generate;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn small_model() -> SparseQuadraticModel {
        let data = generate(8, 5, 2, 3).unwrap();
        SparseQuadraticModel::new(&data, Hyperparameters::for_sparsity(2)).unwrap()
    }

    fn random_point(model: &SparseQuadraticModel, seed: u64) -> Vec<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..model.dim()).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn dimension_layout() {
        let model = small_model();
        assert_eq!(model.dim(), 3 + 5 + 8);
        assert_eq!(Draw::site_names(5, 8).len(), 4 + 2 * 5 + 8);
    }

    #[test]
    fn constrain_round_trip() {
        let model = small_model();
        let q = random_point(&model, 1);
        let draw = model.constrain(&q);
        assert!(draw.omega.iter().all(|&w| w > 0.0 && w < 2.5));
        assert!(draw.kappa.iter().all(|&k| k > 0.0 && k < draw.msq.sqrt() / draw.eta1 + 1e-12));
        let back = model.unconstrain(&draw);
        for (a, b) in q.iter().zip(&back) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
        assert_eq!(draw.flatten().len(), Draw::site_names(5, 8).len());
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let model = small_model();
        for seed in 0..3 {
            let q = random_point(&model, seed);
            let mut grad = vec![0.0; model.dim()];
            let logp = model.log_density_and_grad(&q, &mut grad).unwrap();
            assert!(logp.is_finite());

            let eps = 1e-6;
            for i in 0..model.dim() {
                let mut qp = q.clone();
                let mut qm = q.clone();
                qp[i] += eps;
                qm[i] -= eps;
                let fd = (model.log_density(&qp).unwrap() - model.log_density(&qm).unwrap())
                    / (2.0 * eps);
                assert!(
                    (grad[i] - fd).abs() < 1e-4 * fd.abs().max(1.0),
                    "seed {} coordinate {}: analytic={}, numerical={}",
                    seed,
                    i,
                    grad[i],
                    fd
                );
            }
        }
    }

    #[test]
    fn observation_factor_matches_triangular_form() {
        // ⅛(yᵀKy − |L⁻¹Ky|²) − Σ log Lᵢᵢ − ½ Σ log ω, evaluated the long way.
        let data = generate(6, 4, 1, 9).unwrap();
        let hypers = Hyperparameters::for_sparsity(1);
        let model = SparseQuadraticModel::new(&data, hypers).unwrap();
        let q = random_point(&model, 4);
        let draw = model.constrain(&q);

        let kx = scale_columns(&data.x, &draw.kappa);
        let k = crate::kernel::gram(&kx, &draw.kernel_params(hypers.c));
        let mut a = k.clone();
        for (i, w) in draw.omega.iter().enumerate() {
            a[(i, i)] += 1.0 / w;
        }
        let l = a.cholesky().unwrap().l();
        let ky = &k * &data.y;
        let linv_ky = l.solve_lower_triangular(&ky).unwrap();
        let obs = 0.125 * (data.y.dot(&ky) - linv_ky.dot(&linv_ky))
            - l.diagonal().iter().map(|d| d.ln()).sum::<f64>()
            - 0.5 * draw.omega.iter().map(|w| w.ln()).sum::<f64>();

        // Everything else in the density is priors plus Jacobians.
        let exp = ParamTransform::Exp;
        let pg = TruncatedPolyaGamma::transform();
        let mut prior = HalfCauchy::new(hypers.phi(6, 4)).log_prob(draw.eta1)
            + InverseGamma::new(2.0, 1.0).log_prob(draw.msq)
            + InverseGamma::new(2.0, 1.0).log_prob(draw.xisq)
            + exp.log_jacobian(q[0])
            + exp.log_jacobian(q[1])
            + exp.log_jacobian(q[2]);
        for (i, l) in draw.lambda.iter().enumerate() {
            prior += HalfCauchy::new(1.0).log_prob(*l) + exp.log_jacobian(q[3 + i]);
        }
        for (i, w) in draw.omega.iter().enumerate() {
            prior += TruncatedPolyaGamma.log_prob(*w) + pg.log_jacobian(q[3 + 4 + i]);
        }

        assert_abs_diff_eq!(model.log_density(&q).unwrap(), prior + obs, epsilon = 1e-9);
    }

    #[test]
    fn rejects_wrong_length() {
        let model = small_model();
        assert!(matches!(
            model.log_density(&[0.0; 3]),
            Err(SlogError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn hyperparameter_validation() {
        assert!(Hyperparameters::for_sparsity(2).validate(5).is_ok());
        assert!(Hyperparameters::for_sparsity(5).validate(5).is_err());
        let bad = Hyperparameters {
            beta1: -1.0,
            ..Hyperparameters::for_sparsity(2)
        };
        assert!(bad.validate(5).is_err());
    }
}
