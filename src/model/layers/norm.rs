use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::Parameterized;
use crate::matrix::Matrix;

/// Batch normalization over the channel axis.
///
/// Statistics are taken over every row of every sample in the batch, so a
/// `T × C` sequence contributes `T` observations per channel. Running
/// statistics follow `running = momentum * running + (1 - momentum) * batch`
/// and replace the batch statistics at inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    gamma: Matrix,
    beta: Matrix,
    running_mean: Matrix,
    running_var: Matrix,
    momentum: f64,
    epsilon: f64,
}

#[derive(Debug, Clone)]
pub struct BatchNormCache {
    normalized: Vec<Matrix>,
    inv_std: Vec<f64>,
}

impl BatchNorm {
    pub fn new(channels: usize, momentum: f64, epsilon: f64) -> Self {
        Self {
            gamma: Matrix::filled(1, channels, 1.0),
            beta: Matrix::zeros(1, channels),
            running_mean: Matrix::zeros(1, channels),
            running_var: Matrix::filled(1, channels, 1.0),
            momentum,
            epsilon,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.cols()
    }

    pub fn running_mean(&self) -> &Matrix {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Matrix {
        &self.running_var
    }

    /// Per-channel mean and biased variance over all rows of the batch.
    fn batch_statistics(&self, batch: &[Matrix]) -> (Vec<f64>, Vec<f64>) {
        let channels = self.channels();
        let count = batch.iter().map(Matrix::rows).sum::<usize>().max(1) as f64;

        let mut mean = vec![0.0; channels];
        for sample in batch {
            for row in sample.row_iter() {
                crate::matrix::vec_add_scaled(&mut mean, row, 1.0);
            }
        }
        mean.iter_mut().for_each(|m| *m /= count);

        let mut var = vec![0.0; channels];
        for sample in batch {
            for row in sample.row_iter() {
                for c in 0..channels {
                    let d = row[c] - mean[c];
                    var[c] += d * d;
                }
            }
        }
        var.iter_mut().for_each(|v| *v /= count);
        (mean, var)
    }

    fn affine(&self, input: &Matrix, mean: &[f64], inv_std: &[f64]) -> (Matrix, Matrix) {
        let gamma = self.gamma.as_slice();
        let beta = self.beta.as_slice();
        let mut normalized = input.clone();
        let mut output = input.clone();
        for r in 0..input.rows() {
            let row = input.row(r);
            for c in 0..row.len() {
                let xhat = (row[c] - mean[c]) * inv_std[c];
                normalized[(r, c)] = xhat;
                output[(r, c)] = gamma[c] * xhat + beta[c];
            }
        }
        (output, normalized)
    }

    /// Normalizes with batch statistics and updates the running averages.
    pub fn forward_train(&mut self, batch: &[Matrix]) -> (Vec<Matrix>, BatchNormCache) {
        let (mean, var) = self.batch_statistics(batch);
        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + self.epsilon).sqrt()).collect();

        let results: Vec<(Matrix, Matrix)> = batch
            .par_iter()
            .map(|x| self.affine(x, &mean, &inv_std))
            .collect();
        let (outputs, normalized): (Vec<Matrix>, Vec<Matrix>) = results.into_iter().unzip();

        let m = self.momentum;
        for (c, (&bm, &bv)) in mean.iter().zip(var.iter()).enumerate() {
            let rm = &mut self.running_mean.as_mut_slice()[c];
            *rm = m * *rm + (1.0 - m) * bm;
            let rv = &mut self.running_var.as_mut_slice()[c];
            *rv = m * *rv + (1.0 - m) * bv;
        }

        (outputs, BatchNormCache { normalized, inv_std })
    }

    pub fn infer(&self, input: &Matrix) -> Matrix {
        let inv_std: Vec<f64> = self
            .running_var
            .as_slice()
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        self.affine(input, self.running_mean.as_slice(), &inv_std).0
    }

    /// Returns per-sample input gradients and `[d_gamma, d_beta]`.
    pub fn backward(
        &self,
        cache: &BatchNormCache,
        grad_outputs: &[Matrix],
    ) -> (Vec<Matrix>, Vec<Matrix>) {
        let channels = self.channels();
        let count = grad_outputs.iter().map(Matrix::rows).sum::<usize>().max(1) as f64;

        let mut grad_gamma = Matrix::zeros(1, channels);
        let mut grad_beta = Matrix::zeros(1, channels);
        for (dy, xhat) in grad_outputs.iter().zip(cache.normalized.iter()) {
            for (dy_row, xhat_row) in dy.row_iter().zip(xhat.row_iter()) {
                for c in 0..channels {
                    grad_gamma.as_mut_slice()[c] += dy_row[c] * xhat_row[c];
                    grad_beta.as_mut_slice()[c] += dy_row[c];
                }
            }
        }

        // dx = γ·inv_std/N · (N·dy - Σdy - x̂·Σ(dy·x̂))
        let gamma = self.gamma.as_slice();
        let sum_dy = grad_beta.as_slice();
        let sum_dy_xhat = grad_gamma.as_slice();
        let grad_inputs = grad_outputs
            .par_iter()
            .zip(cache.normalized.par_iter())
            .map(|(dy, xhat)| {
                let mut dx = Matrix::zeros(dy.rows(), channels);
                for r in 0..dy.rows() {
                    let dy_row = dy.row(r);
                    let xhat_row = xhat.row(r);
                    for (c, out) in dx.row_mut(r).iter_mut().enumerate() {
                        *out = gamma[c] * cache.inv_std[c] / count
                            * (count * dy_row[c] - sum_dy[c] - xhat_row[c] * sum_dy_xhat[c]);
                    }
                }
                dx
            })
            .collect();

        (grad_inputs, vec![grad_gamma, grad_beta])
    }
}

impl Parameterized for BatchNorm {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.gamma, &self.beta]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.gamma, &mut self.beta]
    }
}

#[cfg(test)]
mod tests {
    use super::super::gradcheck::*;
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn batch(rng: &mut ChaCha8Rng) -> Vec<Matrix> {
        (0..3).map(|_| Matrix::glorot_uniform(4, 3, rng)).collect()
    }

    fn batch_loss(norm: &BatchNorm, batch: &[Matrix], weights: &[Matrix]) -> f64 {
        let mut perturbed = norm.clone();
        let (outputs, _) = perturbed.forward_train(batch);
        outputs
            .iter()
            .zip(weights)
            .map(|(y, w)| weighted_sum(y, w))
            .sum()
    }

    #[test]
    fn test_training_output_is_standardized() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut norm = BatchNorm::new(3, 0.9, 1e-3);
        let (outputs, _) = norm.forward_train(&batch(&mut rng));

        let rows: Vec<&[f64]> = outputs.iter().flat_map(|m| m.row_iter()).collect();
        for c in 0..3 {
            let mean = rows.iter().map(|r| r[c]).sum::<f64>() / rows.len() as f64;
            assert!(mean.abs() < 1e-9);
        }
        // running stats moved away from their initial values
        assert!(norm.running_var().as_slice().iter().all(|&v| v < 1.0));
    }

    #[test]
    fn test_inference_uses_running_statistics() {
        let norm = BatchNorm::new(2, 0.9, 0.0);
        let x = Matrix::from_vec(1, 2, vec![3.0, -1.0]).unwrap();
        assert_eq!(norm.infer(&x), x);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut norm = BatchNorm::new(3, 0.9, 1e-3);
        // non-trivial affine parameters
        *norm.parameters_mut()[0] = Matrix::from_vec(1, 3, vec![1.5, -0.5, 0.8]).unwrap();
        *norm.parameters_mut()[1] = Matrix::from_vec(1, 3, vec![0.1, 0.2, -0.3]).unwrap();

        let inputs = batch(&mut rng);
        let weights = batch(&mut rng);

        let (_, cache) = norm.clone().forward_train(&inputs);
        let (grad_inputs, grads) = norm.backward(&cache, &weights);

        for s in 0..inputs.len() {
            let mut target = inputs[s].clone();
            check_matrix(&mut target, &grad_inputs[s], "batchnorm input", |x| {
                let mut shifted_batch = inputs.clone();
                shifted_batch[s] = x.clone();
                batch_loss(&norm, &shifted_batch, &weights)
            });
        }

        let mut perturbed = norm.clone();
        for (k, analytic) in grads.iter().enumerate() {
            let mut target = perturbed.parameters()[k].clone();
            check_matrix(&mut target, analytic, "batchnorm param", |p| {
                *perturbed.parameters_mut()[k] = p.clone();
                batch_loss(&perturbed, &inputs, &weights)
            });
            *perturbed.parameters_mut()[k] = target;
        }
    }
}
