//! slog CLI

use anyhow::{Context, Result};
use clap::Parser;
use slog_core::config::{load_hypers, ExperimentConfig};
use slog_core::experiment;
use slog_core::model::Hyperparameters;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "slog")]
#[command(about = "Sparse quadratic-kernel logistic GP fitted with NUTS")]
#[command(version)]
struct Cli {
    /// Post-warmup draws per chain
    #[arg(short = 'n', long, default_value = "300")]
    num_samples: usize,

    #[arg(long, default_value = "200")]
    num_warmup: usize,

    #[arg(long, default_value = "1")]
    num_chains: usize,

    /// Maximum tree depth
    #[arg(long, default_value = "6")]
    mtd: usize,

    #[arg(long, default_value = "200")]
    num_data: usize,

    #[arg(long, default_value = "128")]
    num_dimensions: usize,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Dimensions that carry signal in the generated data
    #[arg(long, default_value = "6")]
    active_dimensions: usize,

    /// Keep every n-th draw when summarising coefficients
    #[arg(long, default_value = "10")]
    thinning: usize,

    /// Threads (0 = auto)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Directory for the JSON results file. Nothing is written if omitted.
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// JSON file overriding the prior hyperparameters
    #[arg(long)]
    hypers: Option<PathBuf>,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

impl Cli {
    fn experiment_config(&self) -> Result<ExperimentConfig> {
        let hypers = match &self.hypers {
            Some(path) => load_hypers(path)
                .with_context(|| format!("failed to read hyperparameters from {}", path.display()))?,
            None => Hyperparameters::for_sparsity(self.active_dimensions),
        };
        Ok(ExperimentConfig {
            num_samples: self.num_samples,
            num_warmup: self.num_warmup,
            num_chains: self.num_chains,
            mtd: self.mtd,
            num_data: self.num_data,
            num_dimensions: self.num_dimensions,
            active_dimensions: self.active_dimensions,
            seed: self.seed,
            thinning: self.thinning,
            num_threads: self.threads,
            progress_bar: !self.no_progress,
            hypers,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    let config = cli.experiment_config()?;
    config.validate().context("invalid arguments")?;

    let outcome = experiment::run(&config).context("experiment failed")?;

    println!("{}", outcome.diagnostics.to_table());
    println!("\nMCMC elapsed time: {:.2}s", outcome.elapsed.as_secs_f64());
    for line in outcome.report_lines() {
        println!("{}", line);
    }

    if let Some(dir) = &cli.results_dir {
        let path = outcome
            .results
            .write_json(dir)
            .with_context(|| format!("failed to write results to {}", dir.display()))?;
        tracing::info!(path = %path.display(), "results written");
    }

    Ok(())
}
