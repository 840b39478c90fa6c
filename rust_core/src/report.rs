//! Turning coefficient summaries into selections, scores, and the lines
//! printed at the end of a run.

use crate::config::ExperimentConfig;
use crate::error::Result;
use crate::posterior::CoefficientSummary;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Overlap between what was selected and what generated the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectionScore {
    pub correct: usize,
    /// Selected but not used to generate the data.
    pub spurious: usize,
    pub missed: usize,
}

pub fn score<T: Ord + Copy>(selected: &[T], expected: &[T]) -> SelectionScore {
    let selected: BTreeSet<T> = selected.iter().copied().collect();
    let expected: BTreeSet<T> = expected.iter().copied().collect();
    SelectionScore {
        correct: selected.intersection(&expected).count(),
        spurious: selected.difference(&expected).count(),
        missed: expected.difference(&selected).count(),
    }
}

/// Indices of the active coefficients.
pub fn active_dimensions(summaries: &[CoefficientSummary]) -> Vec<usize> {
    summaries
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_active())
        .map(|(dim, _)| dim)
        .collect()
}

/// All (i, j) with i < j drawn from `dims`.
pub fn candidate_pairs(dims: &[usize]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for (k, &i) in dims.iter().enumerate() {
        for &j in &dims[k + 1..] {
            pairs.push((i.min(j), i.max(j)));
        }
    }
    pairs
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairOutcome {
    pub pair: (usize, usize),
    pub summary: CoefficientSummary,
}

pub fn format_dimension_line(dim: usize, num_dimensions: usize, s: &CoefficientSummary) -> String {
    let status = if s.is_active() { "active" } else { "inactive" };
    format!(
        "[dimension {:02}/{:02}]  {}:\t{:.2e} +- {:.2e}",
        dim + 1,
        num_dimensions,
        status,
        s.mean,
        s.std
    )
}

pub fn format_pair_line(outcome: &PairOutcome) -> String {
    let (i, j) = outcome.pair;
    let s = &outcome.summary;
    if s.is_active() {
        format!(
            "Identified pairwise interaction between dimensions {} and {}: {:.2e} +- {:.2e}",
            i + 1,
            j + 1,
            s.mean,
            s.std
        )
    } else {
        format!(
            "No pairwise interaction between dimensions {} and {}: {:.2e} +- {:.2e}",
            i + 1,
            j + 1,
            s.mean,
            s.std
        )
    }
}

/// `correct_<kind>:  N   false_<kind>:  N   missed_<kind>:  N`
pub fn format_score_line(kind: &str, score: &SelectionScore) -> String {
    format!(
        "correct_{kind}:  {}   false_{kind}:  {}   missed_{kind}:  {}",
        score.correct,
        score.spurious,
        score.missed,
        kind = kind
    )
}

/// Serialisable record of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResults {
    pub args: ExperimentConfig,
    pub num_data: usize,
    pub expected_thetas: Vec<f64>,
    pub coeff_means: Vec<f64>,
    pub coeff_stds: Vec<f64>,
    pub active_dims: Vec<usize>,
    pub active_pairs: Vec<(usize, usize)>,
    pub correct_singletons: usize,
    pub false_singletons: usize,
    pub missed_singletons: usize,
    pub correct_quads: usize,
    pub false_quads: usize,
    pub missed_quads: usize,
}

impl RunResults {
    pub fn new(
        args: &ExperimentConfig,
        expected_thetas: &[f64],
        dimensions: &[CoefficientSummary],
        pairs: &[PairOutcome],
        singletons: SelectionScore,
        quads: SelectionScore,
    ) -> Self {
        Self {
            args: args.clone(),
            num_data: args.num_data,
            expected_thetas: expected_thetas.to_vec(),
            coeff_means: dimensions.iter().map(|s| s.mean).collect(),
            coeff_stds: dimensions.iter().map(|s| s.std).collect(),
            active_dims: active_dimensions(dimensions),
            active_pairs: pairs
                .iter()
                .filter(|p| p.summary.is_active())
                .map(|p| p.pair)
                .collect(),
            correct_singletons: singletons.correct,
            false_singletons: singletons.spurious,
            missed_singletons: singletons.missed,
            correct_quads: quads.correct,
            false_quads: quads.spurious,
            missed_quads: quads.missed,
        }
    }

    /// Write pretty JSON to `dir/<results_file_name>` and return the path.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.args.results_file_name());
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
