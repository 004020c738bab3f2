#![deny(clippy::all)]

pub mod config;
pub mod error;
pub mod logging;
pub mod matrix;
pub mod model;
pub mod normalize;
pub mod persistence;
pub mod predict;
pub mod sanitize;
pub mod synth;
pub mod train;
pub mod types;

pub use error::{ForecastError, Result};
pub use matrix::Matrix;
pub use model::fusion::FusionKind;
pub use model::{ForecastModel, ModelConfig};
pub use normalize::{FeatureNormalizer, NormalizationStats};
pub use persistence::{load_dataset, save_dataset, DatasetMetadata, ModelArtifact};
pub use predict::Predictor;
pub use sanitize::{diagnose_model, DiagnosticResult};
pub use synth::{SequenceSynthesizer, SignalTemplateLibrary, SynthesisConfig};
pub use train::metrics::{ClassificationReport, ConfusionMatrix, EvaluationReport};
pub use train::{TrainedForecaster, Trainer, TrainingConfig, TrainingHistory};
pub use types::*;
