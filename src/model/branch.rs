use rand::Rng;
use serde::{Deserialize, Serialize};

use super::layers::{
    Activation, BatchNorm, BatchNormCache, Conv1d, DenseCache, Dropout, Lstm, LstmCache,
    MaxPool1d, Parameterized, PoolCache, SampleLayer,
};
use crate::matrix::Matrix;

/// conv → batch norm → max pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConvStage {
    conv: Conv1d,
    norm: BatchNorm,
    pool: MaxPool1d,
}

struct StageCache {
    conv: Vec<DenseCache>,
    norm: BatchNormCache,
    pool: Vec<PoolCache>,
}

/// Encoder for one modality: convolution stages, an optional 1×1 projection and
/// a sequence-returning LSTM behind temporal input dropout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvBranch {
    stages: Vec<ConvStage>,
    projection: Option<Conv1d>,
    recurrent_dropout: Dropout,
    lstm: Lstm,
}

pub struct BranchCache {
    stages: Vec<StageCache>,
    projection: Option<Vec<DenseCache>>,
    masks: Vec<Matrix>,
    lstm: Vec<LstmCache>,
}

/// Layer sizes of one branch.
pub struct BranchLayout<'a> {
    pub input_channels: usize,
    pub conv_channels: &'a [usize],
    pub projection: Option<usize>,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub lstm_units: usize,
    pub recurrent_dropout: f64,
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,
}

impl ConvBranch {
    pub fn new<R: Rng>(layout: &BranchLayout<'_>, rng: &mut R) -> Self {
        let mut channels = layout.input_channels;
        let stages = layout
            .conv_channels
            .iter()
            .map(|&out| {
                let stage = ConvStage {
                    conv: Conv1d::new(channels, out, layout.kernel_size, Activation::Relu, rng),
                    norm: BatchNorm::new(
                        out,
                        layout.batch_norm_momentum,
                        layout.batch_norm_epsilon,
                    ),
                    pool: MaxPool1d::new(layout.pool_size),
                };
                channels = out;
                stage
            })
            .collect();

        let projection = layout.projection.map(|width| {
            let conv = Conv1d::new(channels, width, 1, Activation::Relu, rng);
            channels = width;
            conv
        });

        Self {
            stages,
            projection,
            recurrent_dropout: Dropout::temporal(layout.recurrent_dropout),
            lstm: Lstm::new(channels, layout.lstm_units, true, rng),
        }
    }

    pub fn output_width(&self) -> usize {
        self.lstm.hidden()
    }

    pub fn output_len(&self, input_len: usize) -> usize {
        self.stages
            .iter()
            .fold(input_len, |len, stage| stage.pool.output_len(len))
    }

    pub fn forward_train(
        &mut self,
        batch: &[Matrix],
        step_seed: u64,
        stream: u64,
    ) -> (Vec<Matrix>, BranchCache) {
        let mut x = batch.to_vec();
        let mut stage_caches = Vec::with_capacity(self.stages.len());
        for stage in self.stages.iter_mut() {
            let (y, conv) = stage.conv.forward_batch(&x);
            let (y, norm) = stage.norm.forward_train(&y);
            let (y, pool) = stage.pool.forward_batch(&y);
            stage_caches.push(StageCache { conv, norm, pool });
            x = y;
        }

        let projection = self.projection.as_ref().map(|conv| {
            let (y, cache) = conv.forward_batch(&x);
            x = y;
            cache
        });

        let (x, masks) = self.recurrent_dropout.forward_batch(&x, step_seed, stream);
        let (output, lstm) = self.lstm.forward_batch(&x);

        let cache = BranchCache {
            stages: stage_caches,
            projection,
            masks,
            lstm,
        };
        (output, cache)
    }

    pub fn infer(&self, input: &Matrix) -> Matrix {
        let mut x = input.clone();
        for stage in &self.stages {
            x = stage.pool.infer(&stage.norm.infer(&stage.conv.infer(&x)));
        }
        if let Some(conv) = &self.projection {
            x = conv.infer(&x);
        }
        self.lstm.infer(&x)
    }

    /// Parameter gradients in [`Parameterized::parameters`] order.
    pub fn backward(&self, cache: &BranchCache, grad_outputs: &[Matrix]) -> Vec<Matrix> {
        // collected back to front, reversed at the end
        let mut segments: Vec<Vec<Matrix>> = Vec::new();

        let (grad, lstm_grads) = self.lstm.backward_batch(&cache.lstm, grad_outputs);
        segments.push(lstm_grads);
        let mut grad = self.recurrent_dropout.backward_batch(&cache.masks, &grad);

        if let (Some(conv), Some(conv_cache)) = (&self.projection, &cache.projection) {
            let (g, projection_grads) = conv.backward_batch(conv_cache, &grad);
            segments.push(projection_grads);
            grad = g;
        }

        for (stage, stage_cache) in self.stages.iter().zip(&cache.stages).rev() {
            let (g, _) = stage.pool.backward_batch(&stage_cache.pool, &grad);
            let (g, norm_grads) = stage.norm.backward(&stage_cache.norm, &g);
            let (g, conv_grads) = stage.conv.backward_batch(&stage_cache.conv, &g);
            segments.push(norm_grads);
            segments.push(conv_grads);
            grad = g;
        }

        segments.into_iter().rev().flatten().collect()
    }
}

impl Parameterized for ConvBranch {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = Vec::new();
        for stage in &self.stages {
            params.extend(stage.conv.parameters());
            params.extend(stage.norm.parameters());
        }
        if let Some(conv) = &self.projection {
            params.extend(conv.parameters());
        }
        params.extend(self.lstm.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        let mut params = Vec::new();
        for stage in self.stages.iter_mut() {
            params.extend(stage.conv.parameters_mut());
            params.extend(stage.norm.parameters_mut());
        }
        if let Some(conv) = self.projection.as_mut() {
            params.extend(conv.parameters_mut());
        }
        params.extend(self.lstm.parameters_mut());
        params
    }
}
