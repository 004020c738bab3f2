use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Parameterized, SampleLayer};
use crate::matrix::{dot_product, sigmoid, vec_add_scaled, Matrix};

/// Long short-term memory layer, gate order `[i, f, g, o]`.
///
/// `z_t = x_t · W_x + h_{t-1} · W_h + b`, `c_t = f ⊙ c_{t-1} + i ⊙ g`,
/// `h_t = o ⊙ tanh(c_t)`. Emits every hidden state (`T × H`) or only the last
/// one (`1 × H`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lstm {
    w_input: Matrix,
    w_hidden: Matrix,
    bias: Matrix,
    hidden: usize,
    return_sequences: bool,
}

#[derive(Debug, Clone)]
pub struct LstmCache {
    input: Matrix,
    /// Activated gates per step, `T × 4H`
    gates: Matrix,
    cells: Matrix,
    tanh_cells: Matrix,
    hiddens: Matrix,
}

impl Lstm {
    pub fn new<R: Rng>(
        input_dim: usize,
        hidden: usize,
        return_sequences: bool,
        rng: &mut R,
    ) -> Self {
        let mut bias = Matrix::zeros(1, 4 * hidden);
        // forget gate starts open
        bias.as_mut_slice()[hidden..2 * hidden].fill(1.0);
        Self {
            w_input: Matrix::glorot_uniform(input_dim, 4 * hidden, rng),
            w_hidden: Matrix::glorot_uniform(hidden, 4 * hidden, rng),
            bias,
            hidden,
            return_sequences,
        }
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn input_dim(&self) -> usize {
        self.w_input.rows()
    }

    pub fn returns_sequences(&self) -> bool {
        self.return_sequences
    }
}

impl Parameterized for Lstm {
    fn parameters(&self) -> Vec<&Matrix> {
        vec![&self.w_input, &self.w_hidden, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        vec![&mut self.w_input, &mut self.w_hidden, &mut self.bias]
    }
}

impl SampleLayer for Lstm {
    type Cache = LstmCache;

    fn forward_sample(&self, input: &Matrix) -> (Matrix, LstmCache) {
        let h = self.hidden;
        let steps = input.rows();

        let mut gates = input.matmul(&self.w_input);
        gates.add_row_vector(&self.bias);
        let mut cells = Matrix::zeros(steps, h);
        let mut tanh_cells = Matrix::zeros(steps, h);
        let mut hiddens = Matrix::zeros(steps, h);

        let mut h_prev = vec![0.0; h];
        let mut c_prev = vec![0.0; h];
        for t in 0..steps {
            let z = gates.row_mut(t);
            for (j, &hj) in h_prev.iter().enumerate() {
                if hj != 0.0 {
                    vec_add_scaled(z, self.w_hidden.row(j), hj);
                }
            }
            for v in z[..2 * h].iter_mut() {
                *v = sigmoid(*v);
            }
            for v in z[2 * h..3 * h].iter_mut() {
                *v = v.tanh();
            }
            for v in z[3 * h..].iter_mut() {
                *v = sigmoid(*v);
            }

            let z = gates.row(t);
            for j in 0..h {
                let (i, f, g, o) = (z[j], z[h + j], z[2 * h + j], z[3 * h + j]);
                let c = f * c_prev[j] + i * g;
                let tc = c.tanh();
                cells[(t, j)] = c;
                tanh_cells[(t, j)] = tc;
                hiddens[(t, j)] = o * tc;
            }
            c_prev.copy_from_slice(cells.row(t));
            h_prev.copy_from_slice(hiddens.row(t));
        }

        let output = if self.return_sequences {
            hiddens.clone()
        } else {
            Matrix::row_vector(h_prev)
        };
        let cache = LstmCache {
            input: input.clone(),
            gates,
            cells,
            tanh_cells,
            hiddens,
        };
        (output, cache)
    }

    fn backward_sample(&self, cache: &LstmCache, grad_output: &Matrix) -> (Matrix, Vec<Matrix>) {
        let h = self.hidden;
        let steps = cache.input.rows();
        let mut grad_pre = Matrix::zeros(steps, 4 * h);
        let mut dh_next = vec![0.0; h];
        let mut dc_next = vec![0.0; h];

        for t in (0..steps).rev() {
            let mut dh = dh_next.clone();
            if self.return_sequences {
                vec_add_scaled(&mut dh, grad_output.row(t), 1.0);
            } else if t + 1 == steps {
                vec_add_scaled(&mut dh, grad_output.row(0), 1.0);
            }

            let z = cache.gates.row(t);
            let dz = grad_pre.row_mut(t);
            for j in 0..h {
                let (i, f, g, o) = (z[j], z[h + j], z[2 * h + j], z[3 * h + j]);
                let tc = cache.tanh_cells[(t, j)];
                let c_prev = if t > 0 { cache.cells[(t - 1, j)] } else { 0.0 };

                let d_o = dh[j] * tc;
                let dc = dh[j] * o * (1.0 - tc * tc) + dc_next[j];
                let d_i = dc * g;
                let d_g = dc * i;
                let d_f = dc * c_prev;
                dc_next[j] = dc * f;

                dz[j] = d_i * i * (1.0 - i);
                dz[h + j] = d_f * f * (1.0 - f);
                dz[2 * h + j] = d_g * (1.0 - g * g);
                dz[3 * h + j] = d_o * o * (1.0 - o);
            }

            let dz = grad_pre.row(t);
            for (j, d) in dh_next.iter_mut().enumerate() {
                *d = dot_product(dz, self.w_hidden.row(j));
            }
        }

        // h_{t-1} stacked by step, zero row for t = 0
        let mut prev_hiddens = Matrix::zeros(steps, h);
        for t in 1..steps {
            prev_hiddens.row_mut(t).copy_from_slice(cache.hiddens.row(t - 1));
        }

        let grad_w_input = cache.input.transposed_matmul(&grad_pre);
        let grad_w_hidden = prev_hiddens.transposed_matmul(&grad_pre);
        let grad_bias = grad_pre.column_sums();
        let grad_input = grad_pre.matmul_transposed(&self.w_input);
        (grad_input, vec![grad_w_input, grad_w_hidden, grad_bias])
    }
}
