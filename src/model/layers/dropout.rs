use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::matrix::Matrix;

/// Generator for one sample's masks: seeded by the training step, keyed by
/// sample index and a per-layer stream, independent of which thread runs it.
pub fn sample_rng(step_seed: u64, sample: usize, stream: u64) -> ChaCha8Rng {
    let mut rng =
        ChaCha8Rng::seed_from_u64(step_seed ^ (sample as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    rng.set_stream(stream);
    rng
}

/// Inverted dropout; identity at inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    rate: f64,
    /// One mask row shared by every time step (recurrent input dropout)
    shared_over_time: bool,
}

impl Dropout {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 0.99),
            shared_over_time: false,
        }
    }

    pub fn temporal(rate: f64) -> Self {
        Self {
            shared_over_time: true,
            ..Self::new(rate)
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Returns the dropped input and the scaled keep-mask.
    pub fn forward_sample<R: Rng>(&self, input: &Matrix, rng: &mut R) -> (Matrix, Matrix) {
        if self.rate == 0.0 {
            return (input.clone(), Matrix::filled(input.rows(), input.cols(), 1.0));
        }
        let keep = 1.0 - self.rate;
        let scale = 1.0 / keep;
        let mut draw = || if rng.gen::<f64>() < keep { scale } else { 0.0 };

        let mask = if self.shared_over_time {
            let row: Vec<f64> = (0..input.cols()).map(|_| draw()).collect();
            let mut mask = Matrix::zeros(input.rows(), input.cols());
            for r in 0..input.rows() {
                mask.row_mut(r).copy_from_slice(&row);
            }
            mask
        } else {
            let data = (0..input.len()).map(|_| draw()).collect();
            Matrix::from_vec(input.rows(), input.cols(), data)
                .unwrap_or_else(|_| Matrix::zeros(input.rows(), input.cols()))
        };

        (input.zip_map(&mask, |x, m| x * m), mask)
    }

    pub fn forward_batch(
        &self,
        batch: &[Matrix],
        step_seed: u64,
        stream: u64,
    ) -> (Vec<Matrix>, Vec<Matrix>) {
        let results: Vec<(Matrix, Matrix)> = batch
            .par_iter()
            .enumerate()
            .map(|(i, x)| {
                let mut rng = sample_rng(step_seed, i, stream);
                self.forward_sample(x, &mut rng)
            })
            .collect();
        results.into_iter().unzip()
    }

    pub fn backward_batch(&self, masks: &[Matrix], grad_outputs: &[Matrix]) -> Vec<Matrix> {
        masks
            .iter()
            .zip(grad_outputs.iter())
            .map(|(mask, grad)| grad.zip_map(mask, |g, m| g * m))
            .collect()
    }
}
