use crate::error::{Result, SlogError};
use crate::model::Hyperparameters;
use crate::sampler::SamplerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to reproduce one run of the experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub num_samples: usize,
    pub num_warmup: usize,
    pub num_chains: usize,
    /// Maximum NUTS tree depth.
    pub mtd: usize,
    pub num_data: usize,
    pub num_dimensions: usize,
    pub active_dimensions: usize,
    pub seed: u64,
    pub thinning: usize,
    /// 0 lets rayon decide.
    pub num_threads: usize,
    pub progress_bar: bool,
    pub hypers: Hyperparameters,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            num_samples: 300,
            num_warmup: 200,
            num_chains: 1,
            mtd: 6,
            num_data: 200,
            num_dimensions: 128,
            active_dimensions: 6,
            seed: 0,
            thinning: 10,
            num_threads: 0,
            progress_bar: true,
            hypers: Hyperparameters::for_sparsity(6),
        }
    }
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.active_dimensions == 0 || self.active_dimensions >= self.num_dimensions {
            return Err(SlogError::InvalidConfig(format!(
                "active dimensions must satisfy 0 < S < P (S = {}, P = {})",
                self.active_dimensions, self.num_dimensions
            )));
        }
        if self.num_data == 0 {
            return Err(SlogError::InvalidConfig("num_data must be positive".into()));
        }
        self.hypers.validate(self.num_dimensions)?;
        self.sampler_config().validate()
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            num_chains: self.num_chains,
            num_warmup: self.num_warmup,
            num_samples: self.num_samples,
            max_tree_depth: self.mtd,
            thinning: self.thinning,
            seed: self.seed,
            num_threads: self.num_threads,
            progress_bar: self.progress_bar,
        }
    }

    /// `slog.P_<P>.S_<S>.seed_<seed>.ns_<warmup>_<samples>.mtd_<mtd>.json`
    pub fn results_file_name(&self) -> String {
        format!(
            "slog.P_{}.S_{}.seed_{}.ns_{}_{}.mtd_{}.json",
            self.num_dimensions,
            self.active_dimensions,
            self.seed,
            self.num_warmup,
            self.num_samples,
            self.mtd
        )
    }
}

/// Read a JSON hyperparameter override.
pub fn load_hypers(path: &Path) -> Result<Hyperparameters> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
