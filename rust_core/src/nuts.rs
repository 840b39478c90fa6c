//! No-U-Turn Sampler (NUTS) — Hoffman & Gelman (2014) with multinomial
//! sampling (Betancourt 2017).
//!
//!   - Iterative tree doubling (extend trajectory forward or backward)
//!   - Generalized U-turn criterion on subtrees
//!   - Multinomial candidate selection weighted by exp(-H)
//!   - Divergence detection via energy error threshold
//!   - Max tree depth cap

use crate::model::LogDensity;
use crate::progress::ProgressState;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use tracing::debug;

const MAX_DELTA_H: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct NutsConfig {
    /// Initial step size; 0 means pick one with the doubling heuristic.
    pub step_size: f64,
    pub max_tree_depth: usize,
    pub num_draws: usize,
    pub num_warmup: usize,
    pub target_accept: f64,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: 0.0,
            max_tree_depth: 10,
            num_draws: 1000,
            num_warmup: 500,
            target_accept: 0.8,
        }
    }
}

/// Result of a single chain run.
#[derive(Debug, Clone)]
pub struct ChainResult {
    /// Post-warmup positions in unconstrained space, one per draw.
    pub samples: Vec<Vec<f64>>,
    pub accept_rate: f64,
    pub step_size: f64,
    pub divergences: usize,
    pub num_leapfrog: usize,
}

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Clone)]
struct PhasePoint {
    q: Vec<f64>,
    p: Vec<f64>,
    grad: Vec<f64>,
    logp: f64,
}

impl PhasePoint {
    fn energy(&self, inv_mass: &[f64]) -> f64 {
        let ke: f64 = self
            .p
            .iter()
            .zip(inv_mass.iter())
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum();
        -self.logp + ke
    }
}

/// Result of building one subtree during the doubling process.
struct TreeResult {
    left: PhasePoint,
    right: PhasePoint,
    /// Multinomial-selected candidate among the subtree's leaves.
    proposal: PhasePoint,
    log_sum_weight: f64,
    depth: usize,
    /// Σ min(1, exp(-ΔH)) over the leaves, for step-size adaptation.
    sum_accept: f64,
    n_leapfrog: usize,
    turning: bool,
    diverging: bool,
}

struct TreeStats {
    diverging: bool,
    mean_accept_prob: f64,
    n_leapfrog: usize,
}

/// Borrowed pieces shared by every leapfrog step of one transition.
struct Integrator<'a, T: LogDensity> {
    target: &'a T,
    inv_mass: &'a [f64],
    h0: f64,
}

impl<'a, T: LogDensity> Integrator<'a, T> {
    /// Half-step momentum, full-step position, half-step momentum.
    fn leapfrog(&self, point: &PhasePoint, eps: f64) -> PhasePoint {
        let dim = point.q.len();
        let mut p_new: Vec<f64> = (0..dim)
            .map(|i| point.p[i] + 0.5 * eps * point.grad[i])
            .collect();
        let q_new: Vec<f64> = (0..dim)
            .map(|i| point.q[i] + eps * self.inv_mass[i] * p_new[i])
            .collect();

        let mut grad_new = vec![0.0; dim];
        let logp_new = self.target.logp_and_grad(&q_new, &mut grad_new);
        if logp_new.is_finite() {
            for i in 0..dim {
                p_new[i] += 0.5 * eps * grad_new[i];
            }
        }

        PhasePoint {
            q: q_new,
            p: p_new,
            grad: grad_new,
            logp: logp_new,
        }
    }
}

/// Run a single NUTS chain with diagonal mass matrix adaptation.
///
/// Warmup is split into three windows:
///   Phase 1 (15%): step-size adaptation, identity mass matrix
///   Phase 2 (75%): collect samples → diagonal mass matrix
///   Phase 3 (10%): final step-size adaptation with adapted mass matrix
pub fn run_chain<T: LogDensity>(
    target: &T,
    config: &NutsConfig,
    rng: &mut ChaCha8Rng,
    init: Vec<f64>,
    progress: Option<&ProgressState>,
) -> ChainResult {
    let dim = target.dim();
    let total_iters = config.num_warmup + config.num_draws;

    let mut samples = Vec::with_capacity(config.num_draws);
    let mut n_divergences = 0usize;
    let mut n_leapfrog = 0usize;
    let mut sum_accept_prob = 0.0f64;
    let mut total_iters_done = 0u64;

    let mut inv_mass_diag = vec![1.0f64; dim];
    let mut mass_sqrt = vec![1.0f64; dim];

    let phase1_end = config.num_warmup * 15 / 100;
    let phase2_end = config.num_warmup * 90 / 100;
    let mut warmup_q_sum = vec![0.0f64; dim];
    let mut warmup_q_sq_sum = vec![0.0f64; dim];
    let mut warmup_count = 0usize;

    let mut current = PhasePoint {
        q: init,
        p: vec![0.0; dim],
        grad: vec![0.0; dim],
        logp: 0.0,
    };
    current.logp = target.logp_and_grad(&current.q, &mut current.grad);

    let mut step_size = if config.step_size > 0.0 {
        config.step_size
    } else {
        find_initial_step_size(target, &current, &inv_mass_diag, &mass_sqrt, rng)
    };

    // Dual averaging (Stan defaults)
    let mut da_mu = (10.0 * step_size).ln();
    let da_gamma = 0.05;
    let da_t0 = 10.0;
    let da_kappa = 0.75;
    let mut log_eps_bar = step_size.ln();
    let mut h_bar = 0.0f64;
    let mut adapt_count = 0u64;

    for iter in 0..total_iters {
        let is_warmup = iter < config.num_warmup;

        for i in 0..dim {
            let z: f64 = StandardNormal.sample(rng);
            current.p[i] = z * mass_sqrt[i];
        }

        let integrator = Integrator {
            target,
            inv_mass: &inv_mass_diag,
            h0: current.energy(&inv_mass_diag),
        };
        let (proposal, tree_stats) =
            build_tree_iterative(&integrator, &current, step_size, config.max_tree_depth, rng);

        // The multinomial weighting already accounts for acceptance; a
        // proposal drawn from the valid part of the trajectory is kept.
        current.q.copy_from_slice(&proposal.q);
        current.grad.copy_from_slice(&proposal.grad);
        current.logp = proposal.logp;

        if tree_stats.diverging {
            n_divergences += 1;
        }
        n_leapfrog += tree_stats.n_leapfrog;

        let accept_stat = tree_stats.mean_accept_prob;
        sum_accept_prob += accept_stat;
        total_iters_done += 1;

        if let Some(p) = progress {
            p.increment();
            p.add_leapfrog(tree_stats.n_leapfrog);
            if tree_stats.diverging {
                p.add_divergence();
            }
        }

        if is_warmup {
            adapt_count += 1;
            let m = adapt_count as f64;
            let w = 1.0 / (m + da_t0);
            h_bar = (1.0 - w) * h_bar + w * (config.target_accept - accept_stat);
            let log_eps = da_mu - (m.sqrt() / da_gamma) * h_bar;
            step_size = log_eps.exp();
            let m_pow = m.powf(-da_kappa);
            log_eps_bar = m_pow * log_eps + (1.0 - m_pow) * log_eps_bar;

            if iter >= phase1_end && iter < phase2_end {
                for i in 0..dim {
                    warmup_q_sum[i] += current.q[i];
                    warmup_q_sq_sum[i] += current.q[i] * current.q[i];
                }
                warmup_count += 1;
            }

            if iter == phase2_end && warmup_count > 10 {
                let n = warmup_count as f64;
                for i in 0..dim {
                    let mean = warmup_q_sum[i] / n;
                    let var = warmup_q_sq_sum[i] / n - mean * mean;
                    // inverse mass tracks the posterior variance
                    if var > 1e-8 {
                        inv_mass_diag[i] = var;
                        mass_sqrt[i] = 1.0 / var.sqrt();
                    }
                }
                adapt_count = 0;
                h_bar = 0.0;
                step_size =
                    find_initial_step_size(target, &current, &inv_mass_diag, &mass_sqrt, rng);
                da_mu = (10.0 * step_size).ln();
                log_eps_bar = step_size.ln();
                debug!(
                    step_size,
                    window = warmup_count,
                    "adapted diagonal mass matrix"
                );
            }
        }

        if iter + 1 == config.num_warmup {
            step_size = log_eps_bar.exp();
        }

        if !is_warmup {
            samples.push(current.q.clone());
        }
    }

    let accept_rate = if total_iters_done > 0 {
        sum_accept_prob / total_iters_done as f64
    } else {
        0.0
    };

    ChainResult {
        samples,
        accept_rate,
        step_size,
        divergences: n_divergences,
        num_leapfrog: n_leapfrog,
    }
}

/// Build the NUTS tree iteratively by doubling depth.
///
/// At each depth j the new subtree has 2^j leaves and extends the
/// trajectory forward (+ε) or backward (-ε) at random. Sampling stops on a
/// U-turn across the full tree, inside a subtree, or on divergence.
fn build_tree_iterative<T: LogDensity>(
    integrator: &Integrator<'_, T>,
    initial: &PhasePoint,
    eps: f64,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> (PhasePoint, TreeStats) {
    let mut left = initial.clone();
    let mut right = initial.clone();
    let mut proposal = initial.clone();
    let mut log_sum_weight = 0.0f64;
    let mut depth = 0;
    let mut n_leapfrog = 0usize;
    let mut sum_accept_stat = 0.0f64;
    let mut diverging = false;

    while depth < max_depth {
        let forward = rng.gen::<bool>();

        let subtree = if forward {
            build_subtree(integrator, &right, eps, depth, rng)
        } else {
            build_subtree(integrator, &left, -eps, depth, rng)
        };

        n_leapfrog += subtree.n_leapfrog;
        sum_accept_stat += subtree.sum_accept;

        if subtree.diverging {
            diverging = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling toward the new subtree
        let accept_prob = (subtree.log_sum_weight - log_sum_weight).min(0.0).exp();
        if rng.gen::<f64>() < accept_prob {
            proposal = subtree.proposal;
        }
        log_sum_weight = log_sum_exp(log_sum_weight, subtree.log_sum_weight);

        if forward {
            right = subtree.right;
        } else {
            left = subtree.left;
        }

        if check_uturn(&left, &right, integrator.inv_mass) {
            break;
        }

        depth += 1;
        debug_assert_eq!(subtree.depth + 1, depth);
    }

    let mean_accept = if n_leapfrog > 0 {
        (sum_accept_stat / n_leapfrog as f64).min(1.0)
    } else {
        0.0
    };

    (
        proposal,
        TreeStats {
            diverging,
            mean_accept_prob: mean_accept,
            n_leapfrog,
        },
    )
}

/// Recursively build a balanced binary subtree of the given depth.
///
/// depth=0: take a single leapfrog step.
/// depth=j: build two subtrees of depth j-1 and combine.
fn build_subtree<T: LogDensity>(
    integrator: &Integrator<'_, T>,
    point: &PhasePoint,
    eps: f64,
    depth: usize,
    rng: &mut ChaCha8Rng,
) -> TreeResult {
    if depth == 0 {
        let next = integrator.leapfrog(point, eps);
        let delta_h = next.energy(integrator.inv_mass) - integrator.h0;
        let diverging = delta_h > MAX_DELTA_H || !delta_h.is_finite();
        let log_weight = if diverging { f64::NEG_INFINITY } else { -delta_h };
        let accept = if diverging { 0.0 } else { (-delta_h).min(0.0).exp() };

        return TreeResult {
            left: next.clone(),
            right: next.clone(),
            proposal: next,
            log_sum_weight: log_weight,
            depth: 0,
            sum_accept: accept,
            n_leapfrog: 1,
            turning: false,
            diverging,
        };
    }

    let inner = build_subtree(integrator, point, eps, depth - 1, rng);
    if inner.diverging || inner.turning {
        return inner;
    }

    let start_point = if eps > 0.0 { &inner.right } else { &inner.left };
    let outer = build_subtree(integrator, start_point, eps, depth - 1, rng);

    let n_leapfrog = inner.n_leapfrog + outer.n_leapfrog;
    let sum_accept = inner.sum_accept + outer.sum_accept;

    if outer.diverging || outer.turning {
        return TreeResult {
            left: inner.left,
            right: inner.right,
            proposal: inner.proposal,
            log_sum_weight: inner.log_sum_weight,
            depth,
            sum_accept,
            n_leapfrog,
            turning: outer.turning,
            diverging: outer.diverging,
        };
    }

    let log_sum = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let accept_outer = (outer.log_sum_weight - log_sum).exp();
    let proposal = if rng.gen::<f64>() < accept_outer {
        outer.proposal
    } else {
        inner.proposal
    };

    // inner is closer to the start point, outer is farther
    let (left, right) = if eps > 0.0 {
        (inner.left, outer.right)
    } else {
        (outer.left, inner.right)
    };

    let turning = check_uturn(&left, &right, integrator.inv_mass);

    TreeResult {
        left,
        right,
        proposal,
        log_sum_weight: log_sum,
        depth,
        sum_accept,
        n_leapfrog,
        turning,
        diverging: false,
    }
}

/// Generalized U-turn check: the trajectory is turning if the momentum
/// at either end would decrease the distance between the endpoints.
///
///   (q_right - q_left) · (M⁻¹ p_left) < 0  OR
///   (q_right - q_left) · (M⁻¹ p_right) < 0
fn check_uturn(left: &PhasePoint, right: &PhasePoint, inv_mass: &[f64]) -> bool {
    let mut dot_left = 0.0f64;
    let mut dot_right = 0.0f64;
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * (inv_mass[i] * left.p[i]);
        dot_right += dq * (inv_mass[i] * right.p[i]);
    }
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY && b == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Double or halve ε until one leapfrog step crosses an acceptance
/// ratio of 1/2.
fn find_initial_step_size<T: LogDensity>(
    target: &T,
    current: &PhasePoint,
    inv_mass_diag: &[f64],
    mass_sqrt: &[f64],
    rng: &mut ChaCha8Rng,
) -> f64 {
    let p0: Vec<f64> = mass_sqrt
        .iter()
        .map(|&m| {
            let z: f64 = StandardNormal.sample(rng);
            z * m
        })
        .collect();
    let initial = PhasePoint {
        q: current.q.clone(),
        p: p0,
        grad: current.grad.clone(),
        logp: current.logp,
    };
    let h0 = initial.energy(inv_mass_diag);
    let integrator = Integrator {
        target,
        inv_mass: inv_mass_diag,
        h0,
    };
    let threshold = (0.5_f64).ln();

    let mut eps = 1.0;
    let first = h0 - integrator.leapfrog(&initial, eps).energy(inv_mass_diag);
    let direction = if first.is_finite() && first > threshold {
        1.0
    } else {
        -1.0
    };

    for _ in 0..50 {
        let lr = h0 - integrator.leapfrog(&initial, eps).energy(inv_mass_diag);
        if direction > 0.0 && !(lr > threshold) {
            break;
        }
        if direction < 0.0 && lr.is_finite() && lr > threshold {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Independent Gaussians with per-coordinate means and scales.
    struct Gaussian {
        mu: Vec<f64>,
        sigma: Vec<f64>,
    }

    impl LogDensity for Gaussian {
        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64 {
            let mut logp = 0.0;
            for i in 0..q.len() {
                let z = (q[i] - self.mu[i]) / self.sigma[i];
                logp -= 0.5 * z * z;
                grad[i] = -z / self.sigma[i];
            }
            logp
        }
    }

    #[test]
    fn recovers_gaussian_moments() {
        let target = Gaussian {
            mu: vec![1.0, -2.0],
            sigma: vec![0.5, 3.0],
        };
        let config = NutsConfig {
            num_warmup: 500,
            num_draws: 2000,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let result = run_chain(&target, &config, &mut rng, vec![0.0, 0.0], None);

        assert_eq!(result.samples.len(), 2000);
        for d in 0..2 {
            let xs: Vec<f64> = result.samples.iter().map(|s| s[d]).collect();
            let mean = xs.iter().sum::<f64>() / xs.len() as f64;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / xs.len() as f64;
            assert!(
                (mean - target.mu[d]).abs() < 0.25 * target.sigma[d],
                "dim {} mean {}",
                d,
                mean
            );
            let rel = var.sqrt() / target.sigma[d];
            assert!(rel > 0.8 && rel < 1.2, "dim {} std ratio {}", d, rel);
        }
        assert!(result.accept_rate > 0.5);
        assert!(result.num_leapfrog >= 2500);
    }

    #[test]
    fn mass_adaptation_rescales_wide_coordinates() {
        let target = Gaussian {
            mu: vec![0.0, 0.0],
            sigma: vec![0.1, 10.0],
        };
        let config = NutsConfig {
            max_tree_depth: 6,
            num_warmup: 1000,
            num_draws: 2000,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = run_chain(&target, &config, &mut rng, vec![0.0, 0.0], None);

        let xs: Vec<f64> = result.samples.iter().map(|s| s[1]).collect();
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let rel = var.sqrt() / 10.0;
        assert!(rel > 0.75 && rel < 1.25, "wide std ratio {}", rel);

        let lag1 = xs
            .windows(2)
            .map(|w| (w[0] - mean) * (w[1] - mean))
            .sum::<f64>()
            / (n - 1.0)
            / var;
        assert!(lag1 < 0.9, "lag-1 autocorrelation {}", lag1);
        // unit-scale steps once both coordinates are whitened
        assert!(result.step_size > 0.1, "step size {}", result.step_size);
    }

    #[test]
    fn divergent_region_is_never_accepted() {
        // Density that is undefined for q > 1.
        struct Walled;
        impl LogDensity for Walled {
            fn dim(&self) -> usize {
                1
            }
            fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64 {
                if q[0] > 1.0 {
                    return f64::NEG_INFINITY;
                }
                grad[0] = -q[0];
                -0.5 * q[0] * q[0]
            }
        }

        let config = NutsConfig {
            num_warmup: 100,
            num_draws: 300,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = run_chain(&Walled, &config, &mut rng, vec![0.0], None);
        assert!(result.samples.iter().all(|s| s[0] <= 1.0));
    }

    #[test]
    fn log_sum_exp_handles_infinities() {
        assert_eq!(
            log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY),
            f64::NEG_INFINITY
        );
        assert!((log_sum_exp(0.0, 0.0) - 2.0_f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, 1.5), 1.5);
    }
}
