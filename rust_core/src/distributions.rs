//! Prior densities and the transforms that map unconstrained sampler
//! coordinates onto each site's support.
//!
//! Every density returns its log-probability together with the derivative
//! with respect to the constrained value, so the model can assemble the
//! gradient without a tape.

use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

/// Support-mapping transform from an unconstrained real `u` to `x`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamTransform {
    /// x = exp(u), support (0, ∞).
    Exp,
    /// x = upper * sigmoid(u), support (0, upper).
    ScaledSigmoid { upper: f64 },
}

impl ParamTransform {
    pub fn forward(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Exp => u.exp(),
            ParamTransform::ScaledSigmoid { upper } => upper * sigmoid(u),
        }
    }

    pub fn inverse(&self, x: f64) -> f64 {
        match *self {
            ParamTransform::Exp => x.ln(),
            ParamTransform::ScaledSigmoid { upper } => {
                let p = x / upper;
                (p / (1.0 - p)).ln()
            }
        }
    }

    /// log|dx/du|
    pub fn log_jacobian(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Exp => u,
            ParamTransform::ScaledSigmoid { upper } => {
                upper.ln() + log_sigmoid(u) + log_sigmoid(-u)
            }
        }
    }

    /// dx/du
    pub fn dx_du(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Exp => u.exp(),
            ParamTransform::ScaledSigmoid { upper } => {
                let s = sigmoid(u);
                upper * s * (1.0 - s)
            }
        }
    }

    /// d log|dx/du| / du
    pub fn d_log_jacobian_du(&self, u: f64) -> f64 {
        match *self {
            ParamTransform::Exp => 1.0,
            ParamTransform::ScaledSigmoid { .. } => 1.0 - 2.0 * sigmoid(u),
        }
    }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Numerically stable log(sigmoid(x)).
fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

// ── HalfCauchy (x > 0) ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct HalfCauchy {
    pub scale: f64,
}

impl HalfCauchy {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        let z = x / self.scale;
        std::f64::consts::LN_2 - PI.ln() - self.scale.ln() - z.mul_add(z, 1.0).ln()
    }

    /// d log p / dx
    pub fn dlog_prob(&self, x: f64) -> f64 {
        -2.0 * x / (self.scale * self.scale + x * x)
    }
}

// ── InverseGamma (x > 0) ───────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct InverseGamma {
    pub alpha: f64,
    pub beta: f64,
}

impl InverseGamma {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        self.alpha * self.beta.ln() - ln_gamma(self.alpha) - (self.alpha + 1.0) * x.ln()
            - self.beta / x
    }

    pub fn dlog_prob(&self, x: f64) -> f64 {
        -(self.alpha + 1.0) / x + self.beta / (x * x)
    }
}

// ── TruncatedPolyaGamma (0 < x < 2.5) ──────────────────────────────

/// PG(1, 0) restricted to `(0, TRUNCATION_POINT)`.
///
/// The density is the alternating series
/// `Σ (-1)^n (2n+1) / sqrt(2π x³) · exp(-(2n+1)² / (8x))`, truncated after
/// `NUM_LOG_PROB_TERMS` terms. Terms are evaluated relative to the leading
/// one so small `x` does not underflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncatedPolyaGamma;

impl TruncatedPolyaGamma {
    pub const TRUNCATION_POINT: f64 = 2.5;
    pub const NUM_LOG_PROB_TERMS: usize = 7;

    pub fn transform() -> ParamTransform {
        ParamTransform::ScaledSigmoid {
            upper: Self::TRUNCATION_POINT,
        }
    }

    /// Returns `(log p, d log p / dx)`. Outside the support, or where the
    /// truncated series is not positive, log p is `-inf`.
    pub fn log_prob_and_grad(&self, x: f64) -> (f64, f64) {
        if !(x > 0.0 && x <= Self::TRUNCATION_POINT) {
            return (f64::NEG_INFINITY, 0.0);
        }

        // Leading term: log(1) - 1.5 log x - 1/(8x)
        let lead = -1.5 * x.ln() - 0.125 / x;

        let mut series = 0.0f64;
        let mut series_dx = 0.0f64;
        for n in 0..Self::NUM_LOG_PROB_TERMS {
            let k = 2.0 * n as f64 + 1.0;
            let k2 = k * k;
            // term_n / term_0 = k exp(-(k² - 1) / (8x))
            let rel = k * (-(k2 - 1.0) * 0.125 / x).exp();
            let signed = if n % 2 == 0 { rel } else { -rel };
            series += signed;
            // d term_n / dx = term_n (-1.5/x + k²/(8x²))
            series_dx += signed * (-1.5 / x + 0.125 * k2 / (x * x));
        }

        if series <= 0.0 {
            return (f64::NEG_INFINITY, 0.0);
        }

        let log_p = lead + series.ln() - 0.5 * (2.0 * PI).ln();
        (log_p, series_dx / series)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        self.log_prob_and_grad(x).0
    }
}
