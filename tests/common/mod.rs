#![allow(dead_code)]

use emotion_forecast::{
    Dataset, FusionKind, LabelMode, ModelConfig, SequenceSynthesizer, SynthesisConfig,
    TrainingConfig,
};

pub const SEQUENCE_LENGTH: usize = 120;
pub const PREDICTION_HORIZON: usize = 30;

pub fn synthesize(samples: usize, sequence_length: usize, horizon: usize, seed: u64) -> Dataset {
    let mut synthesizer = SequenceSynthesizer::new(SynthesisConfig {
        sequence_length,
        prediction_horizon: horizon,
        label_mode: LabelMode::Current,
        seed,
    })
    .expect("valid synthesis config");
    synthesizer
        .generate_dataset(samples)
        .expect("dataset generation")
}

/// Narrow network for tests that only need a trained artifact, not accuracy.
pub fn small_model_config(sequence_length: usize) -> ModelConfig {
    ModelConfig {
        sequence_length,
        micro_conv_channels: vec![8, 8],
        physio_conv_channels: vec![8, 8],
        micro_projection: 8,
        branch_lstm_units: 8,
        fusion: FusionKind::Projection,
        projection_width: 8,
        fusion_dense_units: 8,
        fusion_lstm_units: 8,
        head_units: 16,
        head_hidden_units: 8,
        ..ModelConfig::default()
    }
}

pub fn quick_training(epochs: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 16,
        learning_rate: 2e-3,
        ..TrainingConfig::default()
    }
}
