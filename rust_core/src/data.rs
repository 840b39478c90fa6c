//! Synthetic classification data in which only the first `S` of `P`
//! dimensions carry a linear signal, plus two pairwise interactions.

use crate::distributions::sigmoid;
use crate::error::{Result, SlogError};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

pub const PAIRWISE_COEFFICIENT: f64 = 3.0;

/// Interaction pairs used to generate the labels.
pub const EXPECTED_PAIRS: [(usize, usize); 2] = [(0, 1), (2, 3)];

#[derive(Debug, Clone)]
pub struct Dataset {
    /// N x P covariates.
    pub x: DMatrix<f64>,
    /// Labels in {-1, +1}.
    pub y: DVector<f64>,
    /// Coefficients of the active dimensions 0..S.
    pub expected_thetas: Vec<f64>,
    pub pairwise_coefficient: f64,
    pub expected_pairs: Vec<(usize, usize)>,
}

impl Dataset {
    pub fn num_data(&self) -> usize {
        self.x.nrows()
    }

    pub fn num_dimensions(&self) -> usize {
        self.x.ncols()
    }

    pub fn expected_active_dims(&self) -> Vec<usize> {
        (0..self.expected_thetas.len()).collect()
    }

    pub fn count_labels(&self) -> (usize, usize) {
        let pos = self.y.iter().filter(|&&v| v == 1.0).count();
        (pos, self.y.len() - pos)
    }
}

fn random_sign(rng: &mut ChaCha8Rng) -> f64 {
    if rng.gen::<bool>() {
        1.0
    } else {
        -1.0
    }
}

/// Draw a dataset of `num_data` rows over `num_dimensions` covariates,
/// `active_dimensions` of which enter the logit linearly.
pub fn generate(
    num_data: usize,
    num_dimensions: usize,
    active_dimensions: usize,
    seed: u64,
) -> Result<Dataset> {
    if active_dimensions == 0 || active_dimensions >= num_dimensions {
        return Err(SlogError::InvalidConfig(format!(
            "active dimensions must satisfy 0 < S < P (S = {}, P = {})",
            active_dimensions, num_dimensions
        )));
    }
    if num_dimensions < 4 {
        return Err(SlogError::InvalidConfig(format!(
            "pairwise interactions need at least 4 dimensions, got {}",
            num_dimensions
        )));
    }
    if num_data == 0 {
        return Err(SlogError::InvalidConfig("num_data must be positive".into()));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let w: Vec<f64> = (0..active_dimensions)
        .map(|_| (1.0 + 1.5 * rng.gen::<f64>()) * random_sign(&mut rng))
        .collect();

    // |x| in [0.5, 1.5) with a random sign
    let x = DMatrix::from_fn(num_data, num_dimensions, |_, _| {
        (rng.gen::<f64>() + 0.5) * random_sign(&mut rng)
    });

    let y = DVector::from_fn(num_data, |n, _| {
        let linear: f64 = (0..active_dimensions).map(|s| x[(n, s)] * w[s]).sum();
        let logit = linear
            + PAIRWISE_COEFFICIENT * (x[(n, 0)] * x[(n, 1)] - x[(n, 2)] * x[(n, 3)]);
        if rng.gen::<f64>() < sigmoid(logit) {
            1.0
        } else {
            -1.0
        }
    });

    let dataset = Dataset {
        x,
        y,
        expected_thetas: w,
        pairwise_coefficient: PAIRWISE_COEFFICIENT,
        expected_pairs: EXPECTED_PAIRS.to_vec(),
    };

    let (pos, neg) = dataset.count_labels();
    info!(num_ones = pos, num_minus_ones = neg, "generated synthetic dataset");

    Ok(dataset)
}
