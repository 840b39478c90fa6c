//! End-to-end run: generate data, sample, summarise coefficients, score.

use crate::config::ExperimentConfig;
use crate::data::{self, Dataset};
use crate::diagnostics::{compute_diagnostics, DiagnosticsReport};
use crate::error::Result;
use crate::model::{Draw, SparseQuadraticModel};
use crate::posterior::{analyze_dimensions, analyze_pairs, CoefficientSummary};
use crate::report::{
    active_dimensions, candidate_pairs, format_dimension_line, format_pair_line, format_score_line,
    score, PairOutcome, RunResults, SelectionScore,
};
use crate::sampler::{self, SampleResult};
use std::time::Duration;
use tracing::info;

pub struct ExperimentOutcome {
    pub dataset: Dataset,
    pub diagnostics: DiagnosticsReport,
    pub dimensions: Vec<CoefficientSummary>,
    pub pairs: Vec<PairOutcome>,
    pub singletons: SelectionScore,
    pub quads: SelectionScore,
    pub results: RunResults,
    pub elapsed: Duration,
}

impl ExperimentOutcome {
    /// Console lines describing the selected coefficients.
    pub fn report_lines(&self) -> Vec<String> {
        let p = self.dataset.num_dimensions();
        let mut lines = vec![format!(
            "Coefficients theta_1 to theta_{} used to generate the data: {}",
            self.dataset.expected_thetas.len(),
            self.dataset
                .expected_thetas
                .iter()
                .map(|t| format!("{:.3}", t))
                .collect::<Vec<_>>()
                .join(", ")
        )];
        lines.extend(
            self.dimensions
                .iter()
                .enumerate()
                .map(|(dim, s)| format_dimension_line(dim, p, s)),
        );
        lines.push(format_score_line("singletons", &self.singletons));
        lines.push(format!(
            "Identified a total of {} active dimensions; expected {}.",
            self.results.active_dims.len(),
            self.dataset.expected_thetas.len()
        ));
        lines.push(format!(
            "The single quadratic coefficient theta_{{1,2}} used to generate the data: {:.1}",
            self.dataset.pairwise_coefficient
        ));
        lines.extend(self.pairs.iter().map(format_pair_line));
        lines.push(format_score_line("quads", &self.quads));
        lines
    }
}

/// Constrained sites for every retained draw, shaped [chain][draw][site]
/// for the diagnostics table.
fn constrained_samples(model: &SparseQuadraticModel, samples: &SampleResult) -> Vec<Vec<Vec<f64>>> {
    samples
        .samples
        .iter()
        .map(|chain| chain.iter().map(|q| model.constrain(q).flatten()).collect())
        .collect()
}

pub fn run(config: &ExperimentConfig) -> Result<ExperimentOutcome> {
    config.validate()?;

    let dataset = data::generate(
        config.num_data,
        config.num_dimensions,
        config.active_dimensions,
        config.seed,
    )?;
    let model = SparseQuadraticModel::new(&dataset, config.hypers)?;

    info!(
        num_data = config.num_data,
        num_dimensions = config.num_dimensions,
        chains = config.num_chains,
        warmup = config.num_warmup,
        samples = config.num_samples,
        "starting inference"
    );
    let samples = sampler::sample(&model, &config.sampler_config())?;

    let names = Draw::site_names(dataset.num_dimensions(), dataset.num_data());
    let diagnostics = compute_diagnostics(
        &constrained_samples(&model, &samples),
        &names,
        &samples.accept_rates,
        samples.divergences,
    );

    let draws: Vec<Draw> = samples
        .thinned()
        .into_iter()
        .map(|q| model.constrain(q))
        .collect();
    info!(draws = draws.len(), "summarising coefficient posteriors");

    let c = config.hypers.c;
    let dimensions = analyze_dimensions(&dataset, &draws, c)?;
    let active = active_dimensions(&dimensions);
    let singletons = score(&active, &dataset.expected_active_dims());

    let candidates = candidate_pairs(&active);
    let pair_summaries = analyze_pairs(&dataset, &draws, c, &candidates)?;
    let pairs: Vec<PairOutcome> = candidates
        .iter()
        .zip(pair_summaries)
        .map(|(&pair, summary)| PairOutcome { pair, summary })
        .collect();
    let active_pairs: Vec<(usize, usize)> = pairs
        .iter()
        .filter(|p| p.summary.is_active())
        .map(|p| p.pair)
        .collect();
    let quads = score(&active_pairs, &dataset.expected_pairs);

    info!(
        active_dims = active.len(),
        active_pairs = active_pairs.len(),
        "posterior summary complete"
    );

    let results = RunResults::new(
        config,
        &dataset.expected_thetas,
        &dimensions,
        &pairs,
        singletons,
        quads,
    );

    Ok(ExperimentOutcome {
        dataset,
        diagnostics,
        dimensions,
        pairs,
        singletons,
        quads,
        results,
        elapsed: samples.elapsed,
    })
}
