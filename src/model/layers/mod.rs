//! Network building blocks with explicit forward and backward passes.
//!
//! A sample flowing through a layer is a `T × C` [`Matrix`] (or `1 × C` after the
//! time axis is collapsed). Per-sample layers implement [`SampleLayer`] and get
//! batch methods that run samples in parallel with rayon and reduce parameter
//! gradients sequentially in sample order, so results do not depend on thread
//! scheduling.

mod conv;
mod dropout;
mod lstm;
mod norm;
mod pool;

use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::matrix::Matrix;

pub use conv::Conv1d;
pub use dropout::{sample_rng, Dropout};
pub use lstm::{Lstm, LstmCache};
pub use norm::{BatchNorm, BatchNormCache};
pub use pool::{MaxPool1d, PoolCache};

/// Layers owning trainable parameters.
///
/// `parameters` and `parameters_mut` list matrices in the same order as the
/// gradients returned by the layer's backward pass.
pub trait Parameterized {
    fn parameters(&self) -> Vec<&Matrix>;

    fn parameters_mut(&mut self) -> Vec<&mut Matrix>;

    fn zero_gradients(&self) -> Vec<Matrix> {
        self.parameters()
            .iter()
            .map(|p| Matrix::zeros(p.rows(), p.cols()))
            .collect()
    }

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

/// A layer applied independently to each sample of a batch.
pub trait SampleLayer: Parameterized + Sync {
    type Cache: Send + Sync;

    fn forward_sample(&self, input: &Matrix) -> (Matrix, Self::Cache);

    /// Returns the input gradient and the parameter gradients.
    fn backward_sample(&self, cache: &Self::Cache, grad_output: &Matrix) -> (Matrix, Vec<Matrix>);

    fn infer(&self, input: &Matrix) -> Matrix {
        self.forward_sample(input).0
    }

    fn forward_batch(&self, batch: &[Matrix]) -> (Vec<Matrix>, Vec<Self::Cache>) {
        let results: Vec<(Matrix, Self::Cache)> =
            batch.par_iter().map(|x| self.forward_sample(x)).collect();
        results.into_iter().unzip()
    }

    fn backward_batch(
        &self,
        caches: &[Self::Cache],
        grad_outputs: &[Matrix],
    ) -> (Vec<Matrix>, Vec<Matrix>) {
        let results: Vec<(Matrix, Vec<Matrix>)> = caches
            .par_iter()
            .zip(grad_outputs.par_iter())
            .map(|(cache, grad)| self.backward_sample(cache, grad))
            .collect();

        let mut param_grads = self.zero_gradients();
        let mut input_grads = Vec::with_capacity(results.len());
        for (input_grad, grads) in results {
            accumulate(&mut param_grads, &grads);
            input_grads.push(input_grad);
        }
        (input_grads, param_grads)
    }
}

/// `into[i] += grads[i]`
pub fn accumulate(into: &mut [Matrix], grads: &[Matrix]) {
    for (acc, g) in into.iter_mut().zip(grads.iter()) {
        acc.add_assign(g);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Self::Linear => x,
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
        }
    }

    /// Derivative expressed through the activation's output.
    pub fn derivative_from_output(&self, y: f64) -> f64 {
        match self {
            Self::Linear => 1.0,
            Self::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Tanh => 1.0 - y * y,
        }
    }
}

/// Fully connected layer applied row-wise: `y = act(x · W + b)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    weight: Matrix,
    bias: Matrix,
    activation: Activation,
}

#[derive(Debug, Clone)]
pub struct DenseCache {
    input: Matrix,
    output: Matrix,
}

impl Dense {
    pub fn new<R: Rng>(
        input_dim: usize,
        output_dim: usize,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Matrix::glorot_uniform(input_dim, output_dim, rng),
            bias: Matrix::zeros(1, output_dim),
            activation,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.rows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.cols()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn weight(&self) -> &Matrix {
        &self.weight
    }
}

impl Parameterized for Dense {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.weight, &mut self.bias]
    }
}

impl SampleLayer for Dense {
    type Cache = DenseCache;

    fn forward_sample(&self, input: &Matrix) -> (Matrix, DenseCache) {
        let output = self.infer(input);
        let cache = DenseCache {
            input: input.clone(),
            output: output.clone(),
        };
        (output, cache)
    }

    fn backward_sample(&self, cache: &DenseCache, grad_output: &Matrix) -> (Matrix, Vec<Matrix>) {
        let activation = self.activation;
        let grad_pre = grad_output.zip_map(&cache.output, |g, y| {
            g * activation.derivative_from_output(y)
        });
        let grad_weight = cache.input.transposed_matmul(&grad_pre);
        let grad_bias = grad_pre.column_sums();
        let grad_input = grad_pre.matmul_transposed(&self.weight);
        (grad_input, vec![grad_weight, grad_bias])
    }

    fn infer(&self, input: &Matrix) -> Matrix {
        let mut z = input.matmul(&self.weight);
        z.add_row_vector(&self.bias);
        let activation = self.activation;
        z.map(|v| activation.apply(v))
    }
}
