//! Per-site convergence summary: R-hat, ESS, MCSE, quantiles.
//!
//! Rank normalisation, split R-hat and tail ESS follow
//!   Vehtari et al. (2021) "Rank-normalization, folding, and localization:
//!   An improved R-hat for assessing convergence of MCMC"

use rayon::prelude::*;
use statrs::function::erf::erfc_inv;
use std::cmp::Ordering;

/// Fewer post-warmup draws per chain than this and ESS / R-hat are NaN.
const MIN_DRAWS_FOR_CONVERGENCE: usize = 4;

const RULE_WIDTH: usize = 104;

/// Per-site diagnostic summary.
#[derive(Debug, Clone)]
pub struct ParamDiagnostics {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub q5: f64,
    pub q95: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
    pub mcse_mean: f64,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamDiagnostics>,
    pub num_chains: usize,
    pub num_draws: usize,
    pub accept_rates: Vec<f64>,
    pub divergences: usize,
}

fn fmt_ess(ess: f64) -> String {
    if ess.is_finite() {
        format!("{:.0}", ess)
    } else {
        "NaN".to_string()
    }
}

impl DiagnosticsReport {
    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = vec![
            format!(
                "{} chains × {} draws per chain",
                self.num_chains, self.num_draws
            ),
            String::new(),
            format!(
                "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>9} {:>9} {:>8} {:>10}",
                "site", "mean", "std", "median", "5.0%", "95.0%", "ess_bulk", "ess_tail", "r_hat",
                "mcse_mean"
            ),
            "─".repeat(RULE_WIDTH),
        ];

        lines.extend(self.params.iter().map(|p| {
            format!(
                "{:<12} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>9} {:>9} {:>8.4} {:>10.6}",
                p.name,
                p.mean,
                p.std,
                p.median,
                p.q5,
                p.q95,
                fmt_ess(p.ess_bulk),
                fmt_ess(p.ess_tail),
                p.r_hat,
                p.mcse_mean,
            )
        }));
        lines.push("─".repeat(RULE_WIDTH));

        let avg_accept =
            self.accept_rates.iter().sum::<f64>() / self.accept_rates.len().max(1) as f64;
        lines.push(format!(
            "Mean accept rate: {:.2}  │  Divergences: {}",
            avg_accept, self.divergences
        ));

        if self.params.iter().any(|p| !(p.r_hat <= 1.05)) {
            lines.push("⚠  Some R-hat values > 1.05, chains may not have converged.".to_string());
        }
        if self.params.iter().any(|p| p.ess_bulk < 400.0 || p.ess_tail < 400.0) {
            lines.push("⚠  Some ESS values < 400, consider more draws.".to_string());
        }
        if self.divergences > 0 {
            lines.push(format!(
                "⚠  {} divergent transitions, results may be unreliable.",
                self.divergences
            ));
        }

        lines.join("\n")
    }
}

/// Compute full diagnostics from samples[chain][draw][site].
pub fn compute_diagnostics(
    samples: &[Vec<Vec<f64>>],
    param_names: &[String],
    accept_rates: &[f64],
    divergences: usize,
) -> DiagnosticsReport {
    let num_chains = samples.len();
    let num_draws = samples.first().map_or(0, |c| c.len());
    let enough_draws = num_chains > 0 && num_draws >= MIN_DRAWS_FOR_CONVERGENCE;

    let params = param_names
        .par_iter()
        .enumerate()
        .map(|(site, name)| {
            let draws = SiteDraws::gather(samples, site);
            let mean = draws.mean();
            let std = draws.std(mean);

            let (ess_bulk, ess_tail, r_hat) = if enough_draws {
                (
                    SplitChains::new(&rank_normalize(&draws.chains)).ess(),
                    draws.ess_tail(),
                    SplitChains::new(&draws.chains).r_hat(),
                )
            } else {
                (f64::NAN, f64::NAN, f64::NAN)
            };
            let mcse_mean = if ess_bulk > 0.0 {
                std / ess_bulk.sqrt()
            } else {
                f64::NAN
            };

            ParamDiagnostics {
                name: name.clone(),
                mean,
                std,
                median: draws.quantile(0.5),
                q5: draws.quantile(0.05),
                q95: draws.quantile(0.95),
                ess_bulk,
                ess_tail,
                r_hat,
                mcse_mean,
            }
        })
        .collect();

    DiagnosticsReport {
        params,
        num_chains,
        num_draws,
        accept_rates: accept_rates.to_vec(),
        divergences,
    }
}

fn total_cmp_nan_equal(a: &f64, b: &f64) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Draws of a single site, per chain and pooled in sorted order.
struct SiteDraws {
    chains: Vec<Vec<f64>>,
    sorted: Vec<f64>,
}

impl SiteDraws {
    fn gather(samples: &[Vec<Vec<f64>>], site: usize) -> Self {
        let chains: Vec<Vec<f64>> = samples
            .iter()
            .map(|chain| chain.iter().map(|draw| draw[site]).collect())
            .collect();
        let mut sorted: Vec<f64> = chains.iter().flatten().copied().collect();
        sorted.sort_unstable_by(total_cmp_nan_equal);
        Self { chains, sorted }
    }

    fn mean(&self) -> f64 {
        mean(&self.sorted)
    }

    /// Sample standard deviation over all chains; NaN below two draws.
    fn std(&self, mean: f64) -> f64 {
        let n = self.sorted.len();
        if n < 2 {
            return f64::NAN;
        }
        let ss: f64 = self.sorted.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1) as f64).sqrt()
    }

    /// Linear interpolation between order statistics.
    fn quantile(&self, q: f64) -> f64 {
        let s = &self.sorted;
        if s.is_empty() {
            return f64::NAN;
        }
        let idx = q * (s.len() - 1) as f64;
        let lo = idx.floor() as usize;
        let hi = (idx.ceil() as usize).min(s.len() - 1);
        let frac = idx - lo as f64;
        s[lo] * (1.0 - frac) + s[hi] * frac
    }

    /// Smaller of the ESS of the 5% and 95% exceedance indicators.
    fn ess_tail(&self) -> f64 {
        let (q5, q95) = (self.quantile(0.05), self.quantile(0.95));
        let indicator = |hit: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
            self.chains
                .iter()
                .map(|c| c.iter().map(|&x| if hit(x) { 1.0 } else { 0.0 }).collect())
                .collect()
        };
        let lower = SplitChains::new(&indicator(&|x: f64| x <= q5)).ess();
        let upper = SplitChains::new(&indicator(&|x: f64| x >= q95)).ess();
        lower.min(upper)
    }
}

/// Each chain cut into two equal halves (the middle draw of an odd-length
/// chain is dropped), with the half means and the pooled within-half variance.
struct SplitChains {
    halves: Vec<Vec<f64>>,
    means: Vec<f64>,
    within: f64,
}

impl SplitChains {
    fn new(chains: &[Vec<f64>]) -> Self {
        let halves: Vec<Vec<f64>> = chains
            .iter()
            .flat_map(|c| {
                let half = c.len() / 2;
                [c[..half].to_vec(), c[c.len() - half..].to_vec()]
            })
            .collect();
        let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
        let n = halves.first().map_or(0, |h| h.len()) as f64;
        let within = halves
            .iter()
            .zip(&means)
            .map(|(h, m)| h.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (n - 1.0))
            .sum::<f64>()
            / halves.len() as f64;
        Self {
            halves,
            means,
            within,
        }
    }

    fn half_len(&self) -> usize {
        self.halves.first().map_or(0, |h| h.len())
    }

    fn degenerate(&self) -> bool {
        !(self.within > 1e-30)
    }

    fn r_hat(&self) -> f64 {
        if self.degenerate() {
            return f64::NAN;
        }
        let m = self.halves.len() as f64;
        let n = self.half_len() as f64;
        let grand = self.means.iter().sum::<f64>() / m;
        let between =
            n / (m - 1.0) * self.means.iter().map(|cm| (cm - grand).powi(2)).sum::<f64>();
        let var_plus = (n - 1.0) / n * self.within + between / n;
        (var_plus / self.within).sqrt()
    }

    /// Autocorrelation at `lag`, pooled over halves.
    fn autocorrelation(&self, lag: usize) -> f64 {
        let n = self.half_len();
        let m = self.halves.len() as f64;
        let gamma: f64 = self
            .halves
            .iter()
            .zip(&self.means)
            .map(|(h, cm)| {
                h[..n - lag]
                    .iter()
                    .zip(&h[lag..])
                    .map(|(a, b)| (a - cm) * (b - cm))
                    .sum::<f64>()
            })
            .sum();
        gamma / (m * (n as f64 - 1.0)) / self.within
    }

    /// ESS with Geyer's initial positive sequence. Lags are evaluated only
    /// until the first negative pair sum.
    fn ess(&self) -> f64 {
        if self.degenerate() {
            return f64::NAN;
        }
        let n = self.half_len();
        let total = (self.halves.len() * n) as f64;
        let mut tau = -1.0;
        let mut lag = 1;
        while lag + 1 < n {
            let pair = self.autocorrelation(lag) + self.autocorrelation(lag + 1);
            if pair < 0.0 {
                break;
            }
            tau += pair;
            lag += 2;
        }
        total / (1.0 + 2.0 * tau.max(1.0 / total))
    }
}

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

/// Replace every draw by the normal score of its pooled rank, ties averaged.
fn rank_normalize(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut indexed: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| c.iter().enumerate().map(move |(di, &v)| (v, ci, di)))
        .collect();
    indexed.sort_unstable_by(|a, b| total_cmp_nan_equal(&a.0, &b.0));

    let total = indexed.len() as f64;
    let mut result: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut start = 0;
    while start < indexed.len() {
        let tie = indexed[start..]
            .iter()
            .take_while(|e| e.0 == indexed[start].0)
            .count();
        let rank = start as f64 + (tie as f64 + 1.0) / 2.0;
        let score = standard_normal_quantile((rank - 0.375) / (total + 0.25));
        for &(_, ci, di) in &indexed[start..start + tie] {
            result[ci][di] = score;
        }
        start += tie;
    }
    result
}

/// Φ⁻¹(p) = −√2 · erfc⁻¹(2p)
fn standard_normal_quantile(p: f64) -> f64 {
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn iid_chains(num_chains: usize, len: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..num_chains)
            .map(|_| (0..len).map(|_| StandardNormal.sample(&mut rng)).collect())
            .collect()
    }

    #[test]
    fn r_hat_near_one_for_mixed_chains() {
        let rh = SplitChains::new(&iid_chains(4, 1000, 1)).r_hat();
        assert!(rh < 1.02, "R-hat should be near 1.0, got {}", rh);
    }

    #[test]
    fn r_hat_large_for_separated_chains() {
        let chain1: Vec<f64> = (0..500).map(|i| i as f64 * 0.001).collect();
        let chain2: Vec<f64> = (0..500).map(|i| 100.0 + i as f64 * 0.001).collect();
        let rh = SplitChains::new(&[chain1, chain2]).r_hat();
        assert!(rh > 1.5, "R-hat should be large, got {}", rh);
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_draw_count() {
        let chains = iid_chains(4, 500, 2);
        let ess = SplitChains::new(&rank_normalize(&chains)).ess();
        assert!(ess > 1000.0 && ess < 4000.0, "bulk ESS {}", ess);
    }

    #[test]
    fn ess_is_small_for_sticky_chains() {
        // long runs of repeated values
        let chains: Vec<Vec<f64>> = (0..2)
            .map(|c| (0..400).map(|i| ((i / 50 + c) % 3) as f64).collect())
            .collect();
        let ess = SplitChains::new(&chains).ess();
        assert!(ess < 100.0, "ESS {}", ess);
    }

    #[test]
    fn odd_length_chains_drop_the_middle_draw() {
        let split = SplitChains::new(&[vec![1.0, 2.0, 3.0, 4.0, 5.0]]);
        assert_eq!(split.halves, vec![vec![1.0, 2.0], vec![4.0, 5.0]]);
    }

    #[test]
    fn constant_site_gives_nan_not_panic() {
        let split = SplitChains::new(&[vec![2.0; 10], vec![2.0; 10]]);
        assert!(split.r_hat().is_nan());
        assert!(split.ess().is_nan());
    }

    #[test]
    fn rank_normalisation_is_symmetric_and_averages_ties() {
        let ranked = rank_normalize(&[vec![3.0, 1.0, 2.0], vec![1.0, 5.0, 4.0]]);
        // the two 1.0s share a score
        assert_eq!(ranked[0][1], ranked[1][0]);
        assert!(ranked[0][1] < ranked[0][2]);
        // scores of the smallest and largest rank mirror each other
        let lo = standard_normal_quantile((1.0 - 0.375) / 6.25);
        let hi = standard_normal_quantile((6.0 - 0.375) / 6.25);
        assert!((lo + hi).abs() < 1e-12);
        assert!((ranked[1][1] - hi).abs() < 1e-12);
        assert!((standard_normal_quantile(0.975) - 1.959964).abs() < 1e-5);
    }

    #[test]
    fn table_lists_every_site() {
        let samples: Vec<Vec<Vec<f64>>> = (0..2)
            .map(|c| {
                (0..200)
                    .map(|i| {
                        let t = (c * 200 + i) as f64;
                        vec![(t * 0.37).sin(), 5.0 + (t * 1.3).cos()]
                    })
                    .collect()
            })
            .collect();
        let names = vec!["eta1".to_string(), "kappa[0]".to_string()];
        let report = compute_diagnostics(&samples, &names, &[0.8, 0.9], 3);
        assert_eq!(report.params.len(), 2);
        assert!((report.params[1].mean - 5.0).abs() < 0.2);
        assert!(report.params[0].q5 < report.params[0].median);
        assert!(report.params[0].median < report.params[0].q95);
        assert!(report.params[0].ess_bulk > 0.0);

        let table = report.to_table();
        assert!(table.contains("eta1"));
        assert!(table.contains("kappa[0]"));
        assert!(table.contains("3 divergent transitions"));
    }

    #[test]
    fn short_runs_report_nan_instead_of_panicking() {
        let samples = vec![vec![vec![1.0], vec![2.0]]];
        let report = compute_diagnostics(&samples, &["x".to_string()], &[1.0], 0);
        assert!(report.params[0].r_hat.is_nan());
        assert!(report.params[0].ess_bulk.is_nan());
        assert!((report.params[0].mean - 1.5).abs() < 1e-12);
    }
}
