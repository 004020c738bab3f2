use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Activation, Dense, DenseCache, Parameterized, SampleLayer};
use crate::matrix::Matrix;

/// 1-D convolution over time with `same` zero padding, expressed as an
/// im2col expansion followed by a dense projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv1d {
    kernel: usize,
    in_channels: usize,
    projection: Dense,
}

impl Conv1d {
    pub fn new<R: Rng>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        Self {
            kernel,
            in_channels,
            projection: Dense::new(kernel * in_channels, out_channels, activation, rng),
        }
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn out_channels(&self) -> usize {
        self.projection.output_dim()
    }

    fn pad_left(&self) -> usize {
        (self.kernel - 1) / 2
    }

    /// Row `t` holds frames `t - pad .. t - pad + kernel`, zero outside the sequence.
    fn im2col(&self, input: &Matrix) -> Matrix {
        let steps = input.rows();
        let c = self.in_channels;
        let pad = self.pad_left();
        let mut cols = Matrix::zeros(steps, self.kernel * c);
        for t in 0..steps {
            for j in 0..self.kernel {
                let src = t + j;
                if src < pad || src - pad >= steps {
                    continue;
                }
                cols.row_mut(t)[j * c..(j + 1) * c].copy_from_slice(input.row(src - pad));
            }
        }
        cols
    }

    fn col2im(&self, grad_cols: &Matrix) -> Matrix {
        let steps = grad_cols.rows();
        let c = self.in_channels;
        let pad = self.pad_left();
        let mut grad = Matrix::zeros(steps, c);
        for t in 0..steps {
            for j in 0..self.kernel {
                let src = t + j;
                if src < pad || src - pad >= steps {
                    continue;
                }
                let block = &grad_cols.row(t)[j * c..(j + 1) * c];
                crate::matrix::vec_add_scaled(grad.row_mut(src - pad), block, 1.0);
            }
        }
        grad
    }
}

impl Parameterized for Conv1d {
    fn parameters(&self) -> Vec<&Matrix> {
        self.projection.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        self.projection.parameters_mut()
    }
}

impl SampleLayer for Conv1d {
    type Cache = DenseCache;

    fn forward_sample(&self, input: &Matrix) -> (Matrix, DenseCache) {
        self.projection.forward_sample(&self.im2col(input))
    }

    fn backward_sample(&self, cache: &DenseCache, grad_output: &Matrix) -> (Matrix, Vec<Matrix>) {
        let (grad_cols, grads) = self.projection.backward_sample(cache, grad_output);
        (self.col2im(&grad_cols), grads)
    }

    fn infer(&self, input: &Matrix) -> Matrix {
        self.projection.infer(&self.im2col(input))
    }
}

#[cfg(test)]
mod tests {
    use super::super::gradcheck::*;
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_same_padding_keeps_length() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let conv = Conv1d::new(3, 5, 3, Activation::Relu, &mut rng);
        let x = Matrix::glorot_uniform(7, 3, &mut rng);
        assert_eq!(conv.infer(&x).shape(), (7, 5));
    }

    #[test]
    fn test_kernel_sees_neighbouring_frames() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let conv = Conv1d::new(1, 1, 3, Activation::Linear, &mut rng);
        let x = Matrix::from_vec(4, 1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let cols = conv.im2col(&x);
        assert_eq!(cols.row(0), &[0.0, 1.0, 2.0]);
        assert_eq!(cols.row(1), &[1.0, 2.0, 3.0]);
        assert_eq!(cols.row(3), &[3.0, 4.0, 0.0]);
    }

    #[test]
    fn test_conv_gradients_match_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let conv = Conv1d::new(2, 3, 3, Activation::Tanh, &mut rng);
        let x = Matrix::glorot_uniform(6, 2, &mut rng);
        let r = Matrix::glorot_uniform(6, 3, &mut rng);

        let (_, cache) = conv.forward_sample(&x);
        let (grad_input, grads) = conv.backward_sample(&cache, &r);

        check_matrix(&mut x.clone(), &grad_input, "conv input", |xi| {
            weighted_sum(&conv.infer(xi), &r)
        });

        let mut perturbed = conv.clone();
        for (k, analytic) in grads.iter().enumerate() {
            let mut target = perturbed.parameters()[k].clone();
            check_matrix(&mut target, analytic, "conv param", |p| {
                *perturbed.parameters_mut()[k] = p.clone();
                weighted_sum(&perturbed.infer(&x), &r)
            });
            *perturbed.parameters_mut()[k] = target;
        }
    }

    #[test]
    fn test_pointwise_kernel_is_dense() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let conv = Conv1d::new(4, 2, 1, Activation::Linear, &mut rng);
        let x = Matrix::glorot_uniform(3, 4, &mut rng);
        let direct = conv.projection.infer(&x);
        assert_eq!(conv.infer(&x), direct);
    }
}
