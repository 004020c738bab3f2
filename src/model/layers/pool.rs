use serde::{Deserialize, Serialize};

use super::{Parameterized, SampleLayer};
use crate::matrix::Matrix;

/// Max pooling over time with stride equal to the window; trailing frames that
/// do not fill a window are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaxPool1d {
    size: usize,
}

#[derive(Debug, Clone)]
pub struct PoolCache {
    input_rows: usize,
    /// Source row of every output element
    argmax: Vec<usize>,
}

impl MaxPool1d {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        input_len / self.size
    }
}

impl Parameterized for MaxPool1d {
    fn parameters(&self) -> Vec<&Matrix> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        Vec::new()
    }
}

impl SampleLayer for MaxPool1d {
    type Cache = PoolCache;

    fn forward_sample(&self, input: &Matrix) -> (Matrix, PoolCache) {
        let out_rows = self.output_len(input.rows());
        let cols = input.cols();
        let mut output = Matrix::zeros(out_rows, cols);
        let mut argmax = vec![0; out_rows * cols];

        for r in 0..out_rows {
            let start = r * self.size;
            for c in 0..cols {
                let mut best = start;
                for src in start + 1..start + self.size {
                    if input[(src, c)] > input[(best, c)] {
                        best = src;
                    }
                }
                output[(r, c)] = input[(best, c)];
                argmax[r * cols + c] = best;
            }
        }

        (
            output,
            PoolCache {
                input_rows: input.rows(),
                argmax,
            },
        )
    }

    fn backward_sample(&self, cache: &PoolCache, grad_output: &Matrix) -> (Matrix, Vec<Matrix>) {
        let cols = grad_output.cols();
        let mut grad = Matrix::zeros(cache.input_rows, cols);
        for r in 0..grad_output.rows() {
            for c in 0..cols {
                grad[(cache.argmax[r * cols + c], c)] += grad_output[(r, c)];
            }
        }
        (grad, Vec::new())
    }
}
