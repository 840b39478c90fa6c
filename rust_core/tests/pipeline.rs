use slog_core::config::ExperimentConfig;
use slog_core::experiment;
use slog_core::model::Hyperparameters;

fn tiny_config(seed: u64) -> ExperimentConfig {
    ExperimentConfig {
        num_samples: 20,
        num_warmup: 30,
        num_chains: 2,
        mtd: 4,
        num_data: 20,
        num_dimensions: 5,
        active_dimensions: 2,
        seed,
        thinning: 2,
        num_threads: 0,
        progress_bar: false,
        hypers: Hyperparameters::for_sparsity(2),
    }
}

#[test]
fn full_pipeline_on_tiny_problem() {
    let config = tiny_config(3);
    let outcome = experiment::run(&config).unwrap();

    assert_eq!(outcome.dimensions.len(), 5);
    assert!(outcome
        .dimensions
        .iter()
        .all(|s| s.mean.is_finite() && s.std.is_finite() && s.std >= 0.0));

    let s = outcome.singletons;
    assert_eq!(s.correct + s.missed, 2);
    assert_eq!(s.correct + s.spurious, outcome.results.active_dims.len());
    let q = outcome.quads;
    assert_eq!(q.correct + q.missed, 2);

    // pairs are only evaluated among active dimensions, with i < j
    let k = outcome.results.active_dims.len();
    assert_eq!(outcome.pairs.len(), k * k.saturating_sub(1) / 2);
    for p in &outcome.pairs {
        assert!(p.pair.0 < p.pair.1);
        assert!(outcome.results.active_dims.contains(&p.pair.0));
        assert!(outcome.results.active_dims.contains(&p.pair.1));
    }

    // 3 scalar sites, lambda and kappa per dimension, omega per row, eta2
    assert_eq!(outcome.diagnostics.params.len(), 3 + 5 + 20 + 1 + 5);
    assert_eq!(outcome.diagnostics.num_chains, 2);
    assert_eq!(outcome.diagnostics.num_draws, 20);

    let lines = outcome.report_lines();
    assert!(lines.iter().any(|l| l.starts_with("[dimension 01/05]")));
    assert!(lines.iter().any(|l| l.starts_with("[dimension 05/05]")));
    assert!(lines.last().unwrap().starts_with("correct_quads:"));
    assert!(lines.iter().any(|l| l.starts_with("correct_singletons:")));
    assert!(lines
        .iter()
        .any(|l| l == "The single quadratic coefficient theta_{1,2} used to generate the data: 3.0"));
}

#[test]
fn same_seed_same_summary() {
    let a = experiment::run(&tiny_config(11)).unwrap();
    let b = experiment::run(&tiny_config(11)).unwrap();
    assert_eq!(a.dimensions, b.dimensions);
    assert_eq!(a.results.active_dims, b.results.active_dims);
}

#[test]
fn invalid_config_is_rejected_before_sampling() {
    let config = ExperimentConfig {
        active_dimensions: 5,
        ..tiny_config(0)
    };
    assert!(experiment::run(&config).is_err());
}
