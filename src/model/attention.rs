//! Scaled dot-product multi-head attention with an explicit backward pass.
//!
//! Self-attention is `forward(x, x)`; cross-attention takes queries from one
//! modality and keys/values from the other. The output is projected back to
//! the query width so fused blocks keep the branch width.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::layers::{Activation, Dense, DenseCache, Dropout, Parameterized, SampleLayer};
use crate::matrix::{softmax_in_place, Matrix};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadAttention {
    heads: usize,
    head_dim: usize,
    query: Dense,
    key: Dense,
    value: Dense,
    output: Dense,
    dropout: Dropout,
}

#[derive(Debug, Clone)]
pub struct AttentionCache {
    query: DenseCache,
    key: DenseCache,
    value: DenseCache,
    output: DenseCache,
    q: Matrix,
    k: Matrix,
    v: Matrix,
    /// Softmax weights per head, `Tq × Tk`
    weights: Vec<Matrix>,
    /// Dropout masks on the weights; `None` at inference
    masks: Option<Vec<Matrix>>,
}

impl MultiHeadAttention {
    pub fn new<R: rand::Rng>(
        query_dim: usize,
        kv_dim: usize,
        heads: usize,
        head_dim: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Self {
        let inner = heads * head_dim;
        Self {
            heads,
            head_dim,
            query: Dense::new(query_dim, inner, Activation::Linear, rng),
            key: Dense::new(kv_dim, inner, Activation::Linear, rng),
            value: Dense::new(kv_dim, inner, Activation::Linear, rng),
            output: Dense::new(inner, query_dim, Activation::Linear, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output.output_dim()
    }

    /// Attention dropout is applied only when `rng` is given.
    pub fn forward(
        &self,
        query: &Matrix,
        kv: &Matrix,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> (Matrix, AttentionCache) {
        let (q, query_cache) = self.query.forward_sample(query);
        let (k, key_cache) = self.key.forward_sample(kv);
        let (v, value_cache) = self.value.forward_sample(kv);
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        let mut context = Matrix::zeros(query.rows(), self.heads * self.head_dim);
        let mut weights = Vec::with_capacity(self.heads);
        let mut masks = rng.as_ref().map(|_| Vec::with_capacity(self.heads));

        for h in 0..self.heads {
            let start = h * self.head_dim;
            let qh = q.columns(start, self.head_dim);
            let kh = k.columns(start, self.head_dim);
            let vh = v.columns(start, self.head_dim);

            let mut scores = qh.matmul_transposed(&kh);
            scores.scale(scale);
            for r in 0..scores.rows() {
                softmax_in_place(scores.row_mut(r));
            }

            let attended = match (rng.as_deref_mut(), masks.as_mut()) {
                (Some(rng), Some(masks)) => {
                    let (dropped, mask) = self.dropout.forward_sample(&scores, rng);
                    masks.push(mask);
                    dropped
                }
                _ => scores.clone(),
            };
            context.set_columns(start, &attended.matmul(&vh));
            weights.push(scores);
        }

        let (out, output_cache) = self.output.forward_sample(&context);
        let cache = AttentionCache {
            query: query_cache,
            key: key_cache,
            value: value_cache,
            output: output_cache,
            q,
            k,
            v,
            weights,
            masks,
        };
        (out, cache)
    }

    pub fn infer(&self, query: &Matrix, kv: &Matrix) -> Matrix {
        self.forward(query, kv, None).0
    }

    /// Returns `(d_query, d_kv, parameter gradients)`.
    pub fn backward(
        &self,
        cache: &AttentionCache,
        grad_output: &Matrix,
    ) -> (Matrix, Matrix, Vec<Matrix>) {
        let (grad_context, grad_out_params) =
            self.output.backward_sample(&cache.output, grad_output);
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        let mut grad_q = Matrix::zeros(cache.q.rows(), cache.q.cols());
        let mut grad_k = Matrix::zeros(cache.k.rows(), cache.k.cols());
        let mut grad_v = Matrix::zeros(cache.v.rows(), cache.v.cols());

        for h in 0..self.heads {
            let start = h * self.head_dim;
            let qh = cache.q.columns(start, self.head_dim);
            let kh = cache.k.columns(start, self.head_dim);
            let vh = cache.v.columns(start, self.head_dim);
            let weights = &cache.weights[h];
            let grad_ctx_h = grad_context.columns(start, self.head_dim);

            let mask = cache.masks.as_ref().map(|m| &m[h]);
            let attended = match mask {
                Some(mask) => weights.zip_map(mask, |a, m| a * m),
                None => weights.clone(),
            };
            grad_v.set_columns(start, &attended.transposed_matmul(&grad_ctx_h));

            let mut grad_weights = grad_ctx_h.matmul_transposed(&vh);
            if let Some(mask) = mask {
                grad_weights = grad_weights.zip_map(mask, |g, m| g * m);
            }

            // softmax backward, row by row
            let mut grad_scores = Matrix::zeros(weights.rows(), weights.cols());
            for r in 0..weights.rows() {
                let a = weights.row(r);
                let g = grad_weights.row(r);
                let inner: f64 = a.iter().zip(g).map(|(a, g)| a * g).sum();
                for (c, out) in grad_scores.row_mut(r).iter_mut().enumerate() {
                    *out = a[c] * (g[c] - inner) * scale;
                }
            }

            grad_q.set_columns(start, &grad_scores.matmul(&kh));
            grad_k.set_columns(start, &grad_scores.transposed_matmul(&qh));
        }

        let (grad_query, grad_query_params) = self.query.backward_sample(&cache.query, &grad_q);
        let (mut grad_kv, grad_key_params) = self.key.backward_sample(&cache.key, &grad_k);
        let (grad_kv_value, grad_value_params) =
            self.value.backward_sample(&cache.value, &grad_v);
        grad_kv.add_assign(&grad_kv_value);

        let mut grads = grad_query_params;
        grads.extend(grad_key_params);
        grads.extend(grad_value_params);
        grads.extend(grad_out_params);
        (grad_query, grad_kv, grads)
    }
}

impl Parameterized for MultiHeadAttention {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = self.query.parameters();
        params.extend(self.key.parameters());
        params.extend(self.value.parameters());
        params.extend(self.output.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        let mut params = self.query.parameters_mut();
        params.extend(self.key.parameters_mut());
        params.extend(self.value.parameters_mut());
        params.extend(self.output.parameters_mut());
        params
    }
}
