//! Dual-branch emotion forecaster.
//!
//! ```text
//! micro  (T × 12) ─ conv64 ─ bn ─ pool ─ conv128 ─ bn ─ pool ─ 1×1 conv64 ─ lstm64 ┐
//!                                                                                  ├─ fusion ─ dense128 ─ bn ─ lstm128 ─ head ─ softmax(7)
//! physio (T × 8)  ─ conv32 ─ bn ─ pool ─ conv64  ─ bn ─ pool ──────────────  lstm64 ┘
//! ```
//!
//! Both branches reach `T/4 × 64` before fusion. Training runs samples in
//! parallel with rayon; dropout masks come from the step seed, the sample index
//! and a per-layer stream, so a fixed seed gives identical updates on any
//! number of threads.

pub mod attention;
pub mod branch;
pub mod fusion;
pub mod layers;
pub mod optim;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::matrix::{softmax_in_place, Matrix};
use crate::train::metrics::cross_entropy;
use crate::types::{
    check_shape, Emotion, Prediction, MICRO_CHANNELS, NUM_EMOTIONS, PHYSIO_CHANNELS,
};

use branch::{BranchCache, BranchLayout, ConvBranch};
use fusion::{FusionCache, FusionKind, FusionStage};
use layers::{
    accumulate, sample_rng, Activation, BatchNorm, BatchNormCache, Dense, DenseCache, Dropout,
    Lstm, LstmCache, Parameterized, SampleLayer,
};
use optim::Adam;

// Dropout streams, one per stochastic layer
const STREAM_MICRO: u64 = 1;
const STREAM_PHYSIO: u64 = 2;
const STREAM_ATTENTION: u64 = 3;
const STREAM_FUSION_DENSE: u64 = 4;
const STREAM_FUSION_RECURRENT: u64 = 5;
const STREAM_HEAD: u64 = 6;
const STREAM_HEAD_HIDDEN: u64 = 7;

/// Architecture hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub sequence_length: usize,
    pub kernel_size: usize,
    pub pool_size: usize,
    pub micro_conv_channels: Vec<usize>,
    pub physio_conv_channels: Vec<usize>,
    /// Width of the 1×1 projection closing the micro convolution stack
    pub micro_projection: usize,
    pub branch_lstm_units: usize,
    pub recurrent_dropout: f64,
    pub fusion: FusionKind,
    pub attention_heads: usize,
    pub attention_head_dim: usize,
    pub attention_dropout: f64,
    /// Per-branch width of the projection fallback
    pub projection_width: usize,
    pub fusion_dense_units: usize,
    pub fusion_dropout: f64,
    pub fusion_lstm_units: usize,
    pub head_units: usize,
    pub head_dropout: f64,
    pub head_hidden_units: usize,
    pub head_hidden_dropout: f64,
    pub batch_norm_momentum: f64,
    pub batch_norm_epsilon: f64,
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            sequence_length: 120,
            kernel_size: 3,
            pool_size: 2,
            micro_conv_channels: vec![64, 128],
            physio_conv_channels: vec![32, 64],
            micro_projection: 64,
            branch_lstm_units: 64,
            recurrent_dropout: 0.3,
            fusion: FusionKind::Attention,
            attention_heads: 4,
            attention_head_dim: 32,
            attention_dropout: 0.1,
            projection_width: 64,
            fusion_dense_units: 128,
            fusion_dropout: 0.4,
            fusion_lstm_units: 128,
            head_units: 256,
            head_dropout: 0.5,
            head_hidden_units: 128,
            head_hidden_dropout: 0.3,
            batch_norm_momentum: 0.9,
            batch_norm_epsilon: 1e-3,
            seed: 42,
        }
    }
}

impl ModelConfig {
    /// Length of both branch encodings.
    pub fn reduced_length(&self) -> usize {
        self.micro_conv_channels
            .iter()
            .fold(self.sequence_length, |len, _| len / self.pool_size.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.micro_conv_channels.is_empty()
            || self.micro_conv_channels.len() != self.physio_conv_channels.len()
        {
            return Err(ForecastError::invalid(format!(
                "branches must downsample equally: {} micro stages vs {} physio stages",
                self.micro_conv_channels.len(),
                self.physio_conv_channels.len()
            )));
        }
        if self.pool_size < 2 {
            return Err(ForecastError::invalid("pool_size must be at least 2"));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(ForecastError::invalid("kernel_size must be odd"));
        }
        if self.reduced_length() == 0 {
            return Err(ForecastError::invalid(format!(
                "sequence_length {} vanishes after {} pooling stages",
                self.sequence_length,
                self.micro_conv_channels.len()
            )));
        }
        let widths = [
            self.micro_projection,
            self.branch_lstm_units,
            self.attention_heads,
            self.attention_head_dim,
            self.projection_width,
            self.fusion_dense_units,
            self.fusion_lstm_units,
            self.head_units,
            self.head_hidden_units,
        ];
        if widths
            .iter()
            .chain(&self.micro_conv_channels)
            .chain(&self.physio_conv_channels)
            .any(|&w| w == 0)
        {
            return Err(ForecastError::invalid("layer widths must be positive"));
        }
        let rates = [
            ("recurrent_dropout", self.recurrent_dropout),
            ("attention_dropout", self.attention_dropout),
            ("fusion_dropout", self.fusion_dropout),
            ("head_dropout", self.head_dropout),
            ("head_hidden_dropout", self.head_hidden_dropout),
        ];
        for (name, rate) in rates {
            if !(0.0..1.0).contains(&rate) {
                return Err(ForecastError::invalid(format!("{name} must be in [0, 1)")));
            }
        }
        if !(0.0..1.0).contains(&self.batch_norm_momentum) || self.batch_norm_epsilon <= 0.0 {
            return Err(ForecastError::invalid("invalid batch normalization settings"));
        }
        Ok(())
    }

    fn branch_layout<'a>(
        &self,
        input_channels: usize,
        conv: &'a [usize],
        projection: Option<usize>,
    ) -> BranchLayout<'a> {
        BranchLayout {
            input_channels,
            conv_channels: conv,
            projection,
            kernel_size: self.kernel_size,
            pool_size: self.pool_size,
            lstm_units: self.branch_lstm_units,
            recurrent_dropout: self.recurrent_dropout,
            batch_norm_momentum: self.batch_norm_momentum,
            batch_norm_epsilon: self.batch_norm_epsilon,
        }
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub probabilities: Vec<Vec<f64>>,
    pub gradient_norm: f64,
}

/// Activations kept by [`ForecastModel::forward_train`] for the backward pass.
pub struct ForwardCache {
    micro: BranchCache,
    physio: BranchCache,
    fusion: Vec<FusionCache>,
    fusion_dense: Vec<DenseCache>,
    fusion_dropout: Vec<Matrix>,
    fusion_norm: BatchNormCache,
    fusion_recurrent_dropout: Vec<Matrix>,
    fusion_lstm: Vec<LstmCache>,
    head: Vec<DenseCache>,
    head_norm: BatchNormCache,
    head_dropout: Vec<Matrix>,
    head_hidden: Vec<DenseCache>,
    head_hidden_dropout: Vec<Matrix>,
    classifier: Vec<DenseCache>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastModel {
    config: ModelConfig,
    micro: ConvBranch,
    physio: ConvBranch,
    fusion: FusionStage,
    fusion_dense: Dense,
    fusion_dropout: Dropout,
    fusion_norm: BatchNorm,
    fusion_recurrent_dropout: Dropout,
    fusion_lstm: Lstm,
    head: Dense,
    head_norm: BatchNorm,
    head_dropout: Dropout,
    head_hidden: Dense,
    head_hidden_dropout: Dropout,
    classifier: Dense,
    trained: bool,
}

impl ForecastModel {
    /// Builds an untrained model; weights are drawn from `config.seed`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let momentum = config.batch_norm_momentum;
        let epsilon = config.batch_norm_epsilon;

        let micro = ConvBranch::new(
            &config.branch_layout(
                MICRO_CHANNELS,
                &config.micro_conv_channels,
                Some(config.micro_projection),
            ),
            &mut rng,
        );
        let physio = ConvBranch::new(
            &config.branch_layout(PHYSIO_CHANNELS, &config.physio_conv_channels, None),
            &mut rng,
        );
        let fusion = FusionStage::new(
            config.fusion,
            config.branch_lstm_units,
            config.attention_heads,
            config.attention_head_dim,
            config.attention_dropout,
            config.projection_width,
            &mut rng,
        );
        let fusion_width = fusion.output_width();

        Ok(Self {
            micro,
            physio,
            fusion,
            fusion_dense: Dense::new(
                fusion_width,
                config.fusion_dense_units,
                Activation::Relu,
                &mut rng,
            ),
            fusion_dropout: Dropout::new(config.fusion_dropout),
            fusion_norm: BatchNorm::new(config.fusion_dense_units, momentum, epsilon),
            fusion_recurrent_dropout: Dropout::temporal(config.recurrent_dropout),
            fusion_lstm: Lstm::new(
                config.fusion_dense_units,
                config.fusion_lstm_units,
                false,
                &mut rng,
            ),
            head: Dense::new(
                config.fusion_lstm_units,
                config.head_units,
                Activation::Relu,
                &mut rng,
            ),
            head_norm: BatchNorm::new(config.head_units, momentum, epsilon),
            head_dropout: Dropout::new(config.head_dropout),
            head_hidden: Dense::new(
                config.head_units,
                config.head_hidden_units,
                Activation::Relu,
                &mut rng,
            ),
            head_hidden_dropout: Dropout::new(config.head_hidden_dropout),
            classifier: Dense::new(
                config.head_hidden_units,
                NUM_EMOTIONS,
                Activation::Linear,
                &mut rng,
            ),
            trained: false,
            config,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Fusion variant actually built, which may differ from the requested one.
    pub fn fusion_kind(&self) -> FusionKind {
        self.fusion.kind()
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Marks fitting as complete; inference is refused before this.
    pub(crate) fn freeze(&mut self) {
        self.trained = true;
    }

    fn check_window(&self, micro: &Matrix, physio: &Matrix) -> Result<()> {
        let len = self.config.sequence_length;
        check_shape("micro window", micro, len, MICRO_CHANNELS)?;
        check_shape("physio window", physio, len, PHYSIO_CHANNELS)
    }

    fn check_batch(&self, micro: &[Matrix], physio: &[Matrix]) -> Result<()> {
        if micro.is_empty() {
            return Err(ForecastError::EmptyDataset);
        }
        if micro.len() != physio.len() {
            return Err(ForecastError::invalid(format!(
                "{} micro windows but {} physio windows",
                micro.len(),
                physio.len()
            )));
        }
        micro
            .iter()
            .zip(physio)
            .try_for_each(|(m, p)| self.check_window(m, p))
    }

    /// Training-mode forward pass: batch statistics, dropout active, running
    /// statistics updated. Returns per-sample probabilities.
    pub fn forward_train(
        &mut self,
        micro: &[Matrix],
        physio: &[Matrix],
        step_seed: u64,
    ) -> Result<(Vec<Vec<f64>>, ForwardCache)> {
        self.check_batch(micro, physio)?;

        let (micro_enc, micro_cache) = self.micro.forward_train(micro, step_seed, STREAM_MICRO);
        let (physio_enc, physio_cache) =
            self.physio.forward_train(physio, step_seed, STREAM_PHYSIO);

        let fusion = &self.fusion;
        let fused: Vec<(Matrix, FusionCache)> = micro_enc
            .par_iter()
            .zip(physio_enc.par_iter())
            .enumerate()
            .map(|(i, (m, p))| {
                let mut rng = sample_rng(step_seed, i, STREAM_ATTENTION);
                fusion.forward(m, p, Some(&mut rng))
            })
            .collect();
        let (x, fusion_cache): (Vec<Matrix>, Vec<FusionCache>) = fused.into_iter().unzip();

        let (x, fusion_dense) = self.fusion_dense.forward_batch(&x);
        let (x, fusion_dropout) =
            self.fusion_dropout.forward_batch(&x, step_seed, STREAM_FUSION_DENSE);
        let (x, fusion_norm) = self.fusion_norm.forward_train(&x);
        let (x, fusion_recurrent_dropout) = self.fusion_recurrent_dropout.forward_batch(
            &x,
            step_seed,
            STREAM_FUSION_RECURRENT,
        );
        let (x, fusion_lstm) = self.fusion_lstm.forward_batch(&x);

        let (x, head) = self.head.forward_batch(&x);
        let (x, head_norm) = self.head_norm.forward_train(&x);
        let (x, head_dropout) = self.head_dropout.forward_batch(&x, step_seed, STREAM_HEAD);
        let (x, head_hidden) = self.head_hidden.forward_batch(&x);
        let (x, head_hidden_dropout) =
            self.head_hidden_dropout
                .forward_batch(&x, step_seed, STREAM_HEAD_HIDDEN);
        let (logits, classifier) = self.classifier.forward_batch(&x);

        let probabilities = logits.iter().map(softmax_row).collect();
        let cache = ForwardCache {
            micro: micro_cache,
            physio: physio_cache,
            fusion: fusion_cache,
            fusion_dense,
            fusion_dropout,
            fusion_norm,
            fusion_recurrent_dropout,
            fusion_lstm,
            head,
            head_norm,
            head_dropout,
            head_hidden,
            head_hidden_dropout,
            classifier,
        };
        Ok((probabilities, cache))
    }

    /// Gradients of the loss w.r.t. every parameter, in [`Parameterized::parameters`]
    /// order, given the gradient w.r.t. the logits (`1 × 7` per sample).
    ///
    /// The cache must come from [`ForecastModel::forward_train`] on a model of the
    /// same configuration, with one logit gradient per window.
    pub fn backward(&self, cache: &ForwardCache, grad_logits: &[Matrix]) -> Result<Vec<Matrix>> {
        if grad_logits.len() != cache.classifier.len() {
            return Err(ForecastError::invalid(format!(
                "{} logit gradients for a batch of {}",
                grad_logits.len(),
                cache.classifier.len()
            )));
        }
        let kind = self.fusion.kind();
        if let Some(foreign) = cache.fusion.iter().find(|c| c.kind() != kind) {
            return Err(ForecastError::invalid(format!(
                "{} fusion cache passed to a {} fusion model",
                foreign.kind().as_str(),
                kind.as_str()
            )));
        }
        let (g, classifier) = self.classifier.backward_batch(&cache.classifier, grad_logits);
        let g = self.head_hidden_dropout.backward_batch(&cache.head_hidden_dropout, &g);
        let (g, head_hidden) = self.head_hidden.backward_batch(&cache.head_hidden, &g);
        let g = self.head_dropout.backward_batch(&cache.head_dropout, &g);
        let (g, head_norm) = self.head_norm.backward(&cache.head_norm, &g);
        let (g, head) = self.head.backward_batch(&cache.head, &g);

        let (g, fusion_lstm) = self.fusion_lstm.backward_batch(&cache.fusion_lstm, &g);
        let g = self
            .fusion_recurrent_dropout
            .backward_batch(&cache.fusion_recurrent_dropout, &g);
        let (g, fusion_norm) = self.fusion_norm.backward(&cache.fusion_norm, &g);
        let g = self.fusion_dropout.backward_batch(&cache.fusion_dropout, &g);
        let (g, fusion_dense) = self.fusion_dense.backward_batch(&cache.fusion_dense, &g);

        let fusion_results: Vec<(Matrix, Matrix, Vec<Matrix>)> = cache
            .fusion
            .par_iter()
            .zip(g.par_iter())
            .map(|(c, g)| self.fusion.backward(c, g))
            .collect::<Result<_>>()?;
        let mut grad_micro = Vec::with_capacity(fusion_results.len());
        let mut grad_physio = Vec::with_capacity(fusion_results.len());
        let mut fusion_grads = Vec::with_capacity(fusion_results.len());
        for (dm, dp, grads) in fusion_results {
            grad_micro.push(dm);
            grad_physio.push(dp);
            fusion_grads.push(grads);
        }
        let mut fusion = self.fusion.zero_gradients();
        for grads in &fusion_grads {
            accumulate(&mut fusion, grads);
        }

        let micro = self.micro.backward(&cache.micro, &grad_micro);
        let physio = self.physio.backward(&cache.physio, &grad_physio);

        Ok([
            micro,
            physio,
            fusion,
            fusion_dense,
            fusion_norm,
            fusion_lstm,
            head,
            head_norm,
            head_hidden,
            classifier,
        ]
        .into_iter()
        .flatten()
        .collect())
    }

    /// One Adam update on a batch with mean cross-entropy loss.
    pub fn train_step(
        &mut self,
        micro: &[Matrix],
        physio: &[Matrix],
        labels: &[Emotion],
        optimizer: &mut Adam,
        step_seed: u64,
    ) -> Result<StepOutput> {
        if labels.len() != micro.len() {
            return Err(ForecastError::invalid(format!(
                "{} labels for {} windows",
                labels.len(),
                micro.len()
            )));
        }
        let (probabilities, cache) = self.forward_train(micro, physio, step_seed)?;
        let loss = cross_entropy(&probabilities, labels);

        // d(mean CE)/d logits = (p - onehot) / B
        let batch = labels.len() as f64;
        let grad_logits: Vec<Matrix> = probabilities
            .iter()
            .zip(labels)
            .map(|(p, label)| {
                let mut g = p.clone();
                g[label.index()] -= 1.0;
                g.iter_mut().for_each(|v| *v /= batch);
                Matrix::row_vector(g)
            })
            .collect();

        let grads = self.backward(&cache, &grad_logits)?;
        let gradient_norm = optimizer.step(self.parameters_mut(), &grads);
        Ok(StepOutput {
            loss,
            probabilities,
            gradient_norm,
        })
    }

    /// Inference-mode pass for one window pair; no checks, no state change.
    pub(crate) fn infer_window(&self, micro: &Matrix, physio: &Matrix) -> Vec<f64> {
        let m = self.micro.infer(micro);
        let p = self.physio.infer(physio);
        let x = self.fusion.infer(&m, &p);
        let x = self.fusion_norm.infer(&self.fusion_dense.infer(&x));
        let x = self.fusion_lstm.infer(&x);
        let x = self.head_norm.infer(&self.head.infer(&x));
        let x = self.head_hidden.infer(&x);
        softmax_row(&self.classifier.infer(&x))
    }

    /// Inference over a batch regardless of the trained flag; used while fitting.
    pub(crate) fn infer_batch(
        &self,
        micro: &[Matrix],
        physio: &[Matrix],
    ) -> Result<Vec<Vec<f64>>> {
        self.check_batch(micro, physio)?;
        Ok(micro
            .par_iter()
            .zip(physio.par_iter())
            .map(|(m, p)| self.infer_window(m, p))
            .collect())
    }

    /// Probability per vocabulary emotion for one aligned window pair.
    pub fn predict_proba(&self, micro: &Matrix, physio: &Matrix) -> Result<Vec<f64>> {
        if !self.trained {
            return Err(ForecastError::ModelUnavailable);
        }
        self.check_window(micro, physio)?;
        Ok(self.infer_window(micro, physio))
    }

    pub fn predict(&self, micro: &Matrix, physio: &Matrix) -> Result<Prediction> {
        self.predict_proba(micro, physio)
            .map(Prediction::from_distribution)
    }
}

fn softmax_row(logits: &Matrix) -> Vec<f64> {
    let mut p = logits.row(0).to_vec();
    softmax_in_place(&mut p);
    p
}

impl Parameterized for ForecastModel {
    fn parameters(&self) -> Vec<&Matrix> {
        let mut params = self.micro.parameters();
        params.extend(self.physio.parameters());
        params.extend(self.fusion.parameters());
        params.extend(self.fusion_dense.parameters());
        params.extend(self.fusion_norm.parameters());
        params.extend(self.fusion_lstm.parameters());
        params.extend(self.head.parameters());
        params.extend(self.head_norm.parameters());
        params.extend(self.head_hidden.parameters());
        params.extend(self.classifier.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        let mut params = self.micro.parameters_mut();
        params.extend(self.physio.parameters_mut());
        params.extend(self.fusion.parameters_mut());
        params.extend(self.fusion_dense.parameters_mut());
        params.extend(self.fusion_norm.parameters_mut());
        params.extend(self.fusion_lstm.parameters_mut());
        params.extend(self.head.parameters_mut());
        params.extend(self.head_norm.parameters_mut());
        params.extend(self.head_hidden.parameters_mut());
        params.extend(self.classifier.parameters_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::layers::gradcheck::{assert_close, STEP};
    use super::*;

    /// Small network with every stochastic layer active.
    fn tiny_config(fusion: FusionKind) -> ModelConfig {
        ModelConfig {
            sequence_length: 8,
            micro_conv_channels: vec![4, 6],
            physio_conv_channels: vec![3, 4],
            micro_projection: 4,
            branch_lstm_units: 4,
            fusion,
            attention_heads: 2,
            attention_head_dim: 2,
            projection_width: 3,
            fusion_dense_units: 5,
            fusion_lstm_units: 5,
            head_units: 6,
            head_hidden_units: 5,
            ..ModelConfig::default()
        }
    }

    fn batch(n: usize, len: usize, seed: u64) -> (Vec<Matrix>, Vec<Matrix>, Vec<Emotion>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let micro = (0..n)
            .map(|_| Matrix::glorot_uniform(len, MICRO_CHANNELS, &mut rng))
            .collect();
        let physio = (0..n)
            .map(|_| Matrix::glorot_uniform(len, PHYSIO_CHANNELS, &mut rng))
            .collect();
        let labels = (0..n).map(|i| Emotion::ALL[i % NUM_EMOTIONS]).collect();
        (micro, physio, labels)
    }

    #[test]
    fn test_default_branches_align() {
        let config = ModelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reduced_length(), 30);
    }

    #[test]
    fn test_validate_rejects_unequal_downsampling() {
        let config = ModelConfig {
            physio_conv_channels: vec![32],
            ..ModelConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ForecastError::InvalidParameter(_))
        ));
        let config = ModelConfig {
            sequence_length: 3,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_untrained_model_refuses_prediction() {
        let model = ForecastModel::new(tiny_config(FusionKind::Projection)).unwrap();
        let (micro, physio, _) = batch(1, 8, 1);
        assert!(matches!(
            model.predict(&micro[0], &physio[0]),
            Err(ForecastError::ModelUnavailable)
        ));
    }

    #[test]
    fn test_prediction_rejects_wrong_channel_count() {
        let mut model = ForecastModel::new(tiny_config(FusionKind::Projection)).unwrap();
        model.freeze();
        let (micro, physio, _) = batch(1, 8, 2);
        let wrong = Matrix::zeros(8, MICRO_CHANNELS - 1);
        match model.predict(&wrong, &physio[0]) {
            Err(ForecastError::ShapeMismatch {
                expected_cols,
                actual_cols,
                ..
            }) => {
                assert_eq!(expected_cols, MICRO_CHANNELS);
                assert_eq!(actual_cols, MICRO_CHANNELS - 1);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
        let short = micro[0].head_rows(7);
        assert!(model.predict(&short, &physio[0]).is_err());
    }

    #[test]
    fn test_probabilities_form_distribution() {
        for kind in [FusionKind::Attention, FusionKind::Projection] {
            let mut model = ForecastModel::new(tiny_config(kind)).unwrap();
            model.freeze();
            let (micro, physio, _) = batch(3, 8, 3);
            for (m, p) in micro.iter().zip(&physio) {
                let prediction = model.predict(m, p).unwrap();
                let total: f64 = prediction.distribution.iter().sum();
                assert!((total - 1.0).abs() < 1e-9);
                assert_eq!(prediction.probabilities.len(), NUM_EMOTIONS);
                assert!(prediction.confidence >= 1.0 / NUM_EMOTIONS as f64);
            }
        }
    }

    #[test]
    fn test_model_gradients_match_finite_differences() {
        for kind in [FusionKind::Attention, FusionKind::Projection] {
            let model = ForecastModel::new(tiny_config(kind)).unwrap();
            let (micro, physio, labels) = batch(3, 8, 4);
            let seed = 17;

            let loss_of = |m: &ForecastModel| {
                let mut scratch = m.clone();
                let (p, _) = scratch.forward_train(&micro, &physio, seed).unwrap();
                cross_entropy(&p, &labels)
            };

            let mut scratch = model.clone();
            let (p, cache) = scratch.forward_train(&micro, &physio, seed).unwrap();
            let grad_logits: Vec<Matrix> = p
                .iter()
                .zip(&labels)
                .map(|(p, label)| {
                    let mut g = p.clone();
                    g[label.index()] -= 1.0;
                    Matrix::row_vector(g.into_iter().map(|v| v / 3.0).collect())
                })
                .collect();
            let grads = model.backward(&cache, &grad_logits).unwrap();
            assert_eq!(grads.len(), model.parameters().len());

            // spot-check the first entries of every parameter matrix
            let mut perturbed = model.clone();
            for (k, analytic) in grads.iter().enumerate() {
                for i in 0..analytic.len().min(3) {
                    let original = perturbed.parameters()[k].as_slice()[i];
                    perturbed.parameters_mut()[k].as_mut_slice()[i] = original + STEP;
                    let plus = loss_of(&perturbed);
                    perturbed.parameters_mut()[k].as_mut_slice()[i] = original - STEP;
                    let minus = loss_of(&perturbed);
                    perturbed.parameters_mut()[k].as_mut_slice()[i] = original;
                    let numeric = (plus - minus) / (2.0 * STEP);
                    assert_close(
                        analytic.as_slice()[i],
                        numeric,
                        &format!("{} param {k}[{i}]", kind.as_str()),
                    );
                }
            }
        }
    }

    #[test]
    fn test_backward_rejects_foreign_cache() {
        let (micro, physio, _) = batch(2, 8, 7);
        let mut projection = ForecastModel::new(tiny_config(FusionKind::Projection)).unwrap();
        let (p, cache) = projection.forward_train(&micro, &physio, 3).unwrap();
        let grad_logits: Vec<Matrix> = p.into_iter().map(Matrix::row_vector).collect();

        assert!(matches!(
            projection.backward(&cache, &grad_logits[..1]),
            Err(ForecastError::InvalidParameter(_))
        ));

        let attention = ForecastModel::new(tiny_config(FusionKind::Attention)).unwrap();
        if attention.fusion_kind() == FusionKind::Attention {
            assert!(matches!(
                attention.backward(&cache, &grad_logits),
                Err(ForecastError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_training_reduces_loss_on_fixed_batch() {
        let config = ModelConfig {
            recurrent_dropout: 0.0,
            attention_dropout: 0.0,
            fusion_dropout: 0.0,
            head_dropout: 0.0,
            head_hidden_dropout: 0.0,
            ..tiny_config(FusionKind::Attention)
        };
        let mut model = ForecastModel::new(config).unwrap();
        let mut adam = Adam::new(0.01, Some(5.0));
        let (micro, physio, labels) = batch(7, 8, 5);

        let first = model
            .train_step(&micro, &physio, &labels, &mut adam, 0)
            .unwrap()
            .loss;
        let mut last = first;
        for step in 1..150 {
            last = model
                .train_step(&micro, &physio, &labels, &mut adam, step)
                .unwrap()
                .loss;
        }
        assert!(last < first * 0.5, "loss {first} -> {last}");
    }

    #[test]
    fn test_forward_is_independent_of_thread_count() {
        let model = ForecastModel::new(tiny_config(FusionKind::Attention)).unwrap();
        let (micro, physio, _) = batch(6, 8, 6);

        let run = |threads: usize| {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap();
            pool.install(|| {
                let mut scratch = model.clone();
                scratch.forward_train(&micro, &physio, 9).unwrap().0
            })
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn test_model_round_trips_through_json() {
        let mut model = ForecastModel::new(tiny_config(FusionKind::Attention)).unwrap();
        model.freeze();
        let json = serde_json::to_string(&model).unwrap();
        let restored: ForecastModel = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, model);
        assert!(restored.is_trained());
    }
}
