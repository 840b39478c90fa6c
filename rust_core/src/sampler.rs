use crate::error::{Result, SlogError};
use crate::model::LogDensity;
use crate::nuts::{self, ChainResult, NutsConfig};
use crate::progress::{spawn_progress_thread, ProgressState};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Attempts at finding a finite starting point before a chain gives up.
pub const MAX_INIT_ATTEMPTS: usize = 100;

/// Initial positions are drawn uniformly from (-INIT_RADIUS, INIT_RADIUS)
/// in unconstrained space.
pub const INIT_RADIUS: f64 = 2.0;

/// Configuration for the multi-chain sampler.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub num_chains: usize,
    pub num_warmup: usize,
    pub num_samples: usize,
    pub max_tree_depth: usize,
    /// Keep every `thinning`-th post-warmup draw of each chain.
    pub thinning: usize,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
    pub progress_bar: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 1,
            num_warmup: 200,
            num_samples: 300,
            max_tree_depth: 6,
            thinning: 10,
            seed: 0,
            num_threads: 0,
            progress_bar: true,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("num_chains", self.num_chains),
            ("num_samples", self.num_samples),
            ("thinning", self.thinning),
            ("max_tree_depth", self.max_tree_depth),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(SlogError::InvalidConfig(format!("{} must be at least 1", name)));
            }
        }
        Ok(())
    }
}

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct SampleResult {
    /// samples[chain][draw][param], unconstrained, all post-warmup draws
    pub samples: Vec<Vec<Vec<f64>>>,
    pub accept_rates: Vec<f64>,
    pub step_sizes: Vec<f64>,
    pub divergences: usize,
    pub num_leapfrog: usize,
    pub thinning: usize,
    pub elapsed: Duration,
}

impl SampleResult {
    /// Every `thinning`-th draw of each chain, chains concatenated.
    pub fn thinned(&self) -> Vec<&[f64]> {
        self.samples
            .iter()
            .flat_map(|chain| chain.iter().step_by(self.thinning).map(|d| d.as_slice()))
            .collect()
    }

    pub fn num_draws(&self) -> usize {
        self.samples.first().map_or(0, |c| c.len())
    }
}

/// Uniform draws in unconstrained space until the density and its gradient
/// are finite.
pub fn initial_position<T: LogDensity>(
    target: &T,
    rng: &mut ChaCha8Rng,
    chain: usize,
) -> Result<Vec<f64>> {
    let dim = target.dim();
    let mut grad = vec![0.0; dim];
    for attempt in 0..MAX_INIT_ATTEMPTS {
        let q: Vec<f64> = (0..dim)
            .map(|_| rng.gen_range(-INIT_RADIUS..INIT_RADIUS))
            .collect();
        let logp = target.logp_and_grad(&q, &mut grad);
        if logp.is_finite() {
            if attempt > 0 {
                debug!(chain, attempt, "found finite initial point");
            }
            return Ok(q);
        }
        warn!(chain, attempt, "rejected initial point with non-finite log density");
    }
    Err(SlogError::InitializationFailed {
        chain,
        attempts: MAX_INIT_ATTEMPTS,
    })
}

fn join_progress(handle: JoinHandle<()>) {
    if handle.join().is_err() {
        warn!("progress thread panicked");
    }
}

/// Run parallel NUTS chains on `target`.
///
/// Each chain gets a deterministic RNG seeded from `config.seed + chain_index`,
/// so results do not depend on thread scheduling.
pub fn sample<T: LogDensity>(target: &T, config: &SamplerConfig) -> Result<SampleResult> {
    config.validate()?;

    if config.num_threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build_global()
            .ok();
    }

    let nuts_config = NutsConfig {
        max_tree_depth: config.max_tree_depth,
        num_draws: config.num_samples,
        num_warmup: config.num_warmup,
        ..Default::default()
    };

    let start = Instant::now();
    let progress = Arc::new(ProgressState::new(
        config.num_chains,
        config.num_samples,
        config.num_warmup,
    ));
    let handle = config
        .progress_bar
        .then(|| spawn_progress_thread(Arc::clone(&progress)));

    let results: Result<Vec<ChainResult>> = (0..config.num_chains)
        .into_par_iter()
        .map(|chain_idx| {
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(chain_idx as u64));
            let init = initial_position(target, &mut rng, chain_idx)?;
            let result = nuts::run_chain(target, &nuts_config, &mut rng, init, Some(progress.as_ref()));
            debug!(
                chain = chain_idx,
                accept_rate = result.accept_rate,
                step_size = result.step_size,
                divergences = result.divergences,
                leapfrog = result.num_leapfrog,
                "chain finished"
            );
            Ok(result)
        })
        .collect();

    progress.finish();
    if let Some(h) = handle {
        join_progress(h);
    }
    let results = results?;
    let elapsed = start.elapsed();

    let divergences: usize = results.iter().map(|r| r.divergences).sum();
    if divergences > 0 {
        warn!(divergences, "divergent transitions, warmup included");
    }
    info!(
        chains = config.num_chains,
        elapsed_s = elapsed.as_secs_f64(),
        "sampling complete"
    );

    Ok(SampleResult {
        accept_rates: results.iter().map(|r| r.accept_rate).collect(),
        step_sizes: results.iter().map(|r| r.step_size).collect(),
        num_leapfrog: results.iter().map(|r| r.num_leapfrog).sum(),
        samples: results.into_iter().map(|r| r.samples).collect(),
        divergences,
        thinning: config.thinning,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StdNormal(usize);

    impl LogDensity for StdNormal {
        fn dim(&self) -> usize {
            self.0
        }
        fn logp_and_grad(&self, q: &[f64], grad: &mut [f64]) -> f64 {
            for (g, x) in grad.iter_mut().zip(q) {
                *g = -x;
            }
            -0.5 * q.iter().map(|x| x * x).sum::<f64>()
        }
    }

    struct Nowhere;

    impl LogDensity for Nowhere {
        fn dim(&self) -> usize {
            2
        }
        fn logp_and_grad(&self, _q: &[f64], _grad: &mut [f64]) -> f64 {
            f64::NEG_INFINITY
        }
    }

    fn quiet(num_chains: usize) -> SamplerConfig {
        SamplerConfig {
            num_chains,
            num_warmup: 100,
            num_samples: 50,
            thinning: 5,
            progress_bar: false,
            seed: 9,
            ..Default::default()
        }
    }

    #[test]
    fn chains_are_reproducible() {
        let a = sample(&StdNormal(3), &quiet(2)).unwrap();
        let b = sample(&StdNormal(3), &quiet(2)).unwrap();
        assert_eq!(a.samples, b.samples);
        assert_eq!(a.samples.len(), 2);
        assert_eq!(a.num_draws(), 50);
        assert_ne!(a.samples[0], a.samples[1]);
    }

    #[test]
    fn thinning_keeps_every_nth_draw() {
        let result = sample(&StdNormal(2), &quiet(2)).unwrap();
        let thinned = result.thinned();
        assert_eq!(thinned.len(), 2 * 10);
        assert_eq!(thinned[1], result.samples[0][5].as_slice());
        assert_eq!(thinned[10], result.samples[1][0].as_slice());
    }

    #[test]
    fn unusable_density_fails_initialization() {
        let err = sample(&Nowhere, &quiet(1)).unwrap_err();
        assert!(matches!(
            err,
            SlogError::InitializationFailed { attempts: MAX_INIT_ATTEMPTS, .. }
        ));
    }

    #[test]
    fn panicking_progress_thread_does_not_propagate() {
        join_progress(std::thread::spawn(|| panic!("render failed")));
    }

    #[test]
    fn zero_thinning_is_rejected() {
        let config = SamplerConfig {
            thinning: 0,
            ..quiet(1)
        };
        assert!(matches!(
            sample(&StdNormal(1), &config),
            Err(SlogError::InvalidConfig(_))
        ));
    }
}
