use serde::{Deserialize, Serialize};

use crate::matrix::Matrix;

/// Adam with optional global-norm gradient clipping.
///
/// Moment buffers are created lazily on the first step and follow the order of
/// the parameter list handed to [`Adam::step`], which must stay fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    clip_norm: Option<f64>,
    step: u64,
    first_moment: Vec<Matrix>,
    second_moment: Vec<Matrix>,
}

impl Adam {
    pub fn new(learning_rate: f64, clip_norm: Option<f64>) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            clip_norm,
            step: 0,
            first_moment: Vec::new(),
            second_moment: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn steps(&self) -> u64 {
        self.step
    }

    /// Applies one update and returns the gradient norm before clipping.
    pub fn step(&mut self, params: Vec<&mut Matrix>, grads: &[Matrix]) -> f64 {
        if self.first_moment.len() != grads.len() {
            self.first_moment = grads
                .iter()
                .map(|g| Matrix::zeros(g.rows(), g.cols()))
                .collect();
            self.second_moment = self.first_moment.clone();
            self.step = 0;
        }

        let norm = grads.iter().map(Matrix::sum_squares).sum::<f64>().sqrt();
        let clip = match self.clip_norm {
            Some(max) if norm > max && norm > 0.0 => max / norm,
            _ => 1.0,
        };

        self.step += 1;
        let t = self.step as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let lr = self.learning_rate;

        for ((param, grad), (m, v)) in params.into_iter().zip(grads).zip(
            self.first_moment
                .iter_mut()
                .zip(self.second_moment.iter_mut()),
        ) {
            let p = param.as_mut_slice();
            let m = m.as_mut_slice();
            let v = v.as_mut_slice();
            for (i, &g) in grad.as_slice().iter().enumerate() {
                let g = g * clip;
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / correction1;
                let v_hat = v[i] / correction2;
                p[i] -= lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
        norm
    }
}
