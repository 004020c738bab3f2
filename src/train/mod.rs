//! Fitting loop around [`ForecastModel`].
//!
//! Split, normalizer fit on the training windows, mini-batch Adam, early
//! stopping on validation accuracy with best-weight restore, and a
//! plateau schedule on validation loss.

pub mod metrics;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ForecastError, Result};
use crate::matrix::Matrix;
use crate::model::layers::Parameterized;
use crate::model::optim::Adam;
use crate::model::{ForecastModel, ModelConfig};
use crate::normalize::FeatureNormalizer;
use crate::predict::Predictor;
use crate::types::{Dataset, Emotion, NUM_EMOTIONS};

use metrics::EvaluationReport;

/// Minimum validation-loss improvement that resets the plateau counter.
const PLATEAU_MIN_DELTA: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub test_fraction: f64,
    /// Fraction of the non-test samples held out for validation
    pub validation_fraction: f64,
    pub early_stopping_patience: usize,
    pub lr_patience: usize,
    pub lr_factor: f64,
    pub min_learning_rate: f64,
    pub clip_norm: Option<f64>,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 32,
            learning_rate: 1e-3,
            test_fraction: 0.2,
            validation_fraction: 0.2,
            early_stopping_patience: 15,
            lr_patience: 8,
            lr_factor: 0.5,
            min_learning_rate: 1e-6,
            clip_norm: Some(5.0),
            seed: 42,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(ForecastError::invalid("epochs and batch_size must be positive"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0)
            || !(self.min_learning_rate.is_finite() && self.min_learning_rate >= 0.0)
        {
            return Err(ForecastError::invalid("learning rates must be positive"));
        }
        if !(0.0..1.0).contains(&self.test_fraction)
            || !(0.0..1.0).contains(&self.validation_fraction)
        {
            return Err(ForecastError::invalid("split fractions must be in [0, 1)"));
        }
        if !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(ForecastError::invalid("lr_factor must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Aligned windows and labels of one split.
#[derive(Debug, Clone, Default)]
pub struct PreparedSplit {
    pub micro: Vec<Matrix>,
    pub physio: Vec<Matrix>,
    pub labels: Vec<Emotion>,
}

impl PreparedSplit {
    pub fn new(micro: Vec<Matrix>, physio: Vec<Matrix>, labels: Vec<Emotion>) -> Result<Self> {
        if micro.len() != physio.len() || micro.len() != labels.len() {
            return Err(ForecastError::invalid(format!(
                "misaligned split: {} micro, {} physio, {} labels",
                micro.len(),
                physio.len(),
                labels.len()
            )));
        }
        Ok(Self {
            micro,
            physio,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn select(&self, indices: &[usize]) -> Self {
        Self {
            micro: indices.iter().map(|&i| self.micro[i].clone()).collect(),
            physio: indices.iter().map(|&i| self.physio[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    fn normalized(&self, normalizer: &FeatureNormalizer) -> Result<Self> {
        let (micro, physio) = normalizer.transform_batch(&self.micro, &self.physio)?;
        Ok(Self {
            micro,
            physio,
            labels: self.labels.clone(),
        })
    }
}

/// Sample indices of each split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

/// Stratified split: per label, the test share is taken first, then the
/// validation share of what remains. Each split is shuffled.
pub fn stratified_split(
    labels: &[Emotion],
    test_fraction: f64,
    validation_fraction: f64,
    seed: u64,
) -> SplitIndices {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); NUM_EMOTIONS];
    for (i, label) in labels.iter().enumerate() {
        by_class[label.index()].push(i);
    }

    let mut split = SplitIndices {
        train: Vec::new(),
        validation: Vec::new(),
        test: Vec::new(),
    };
    for mut members in by_class {
        members.shuffle(&mut rng);
        let n_test = (members.len() as f64 * test_fraction).round() as usize;
        let n_val = ((members.len() - n_test) as f64 * validation_fraction).round() as usize;
        split.test.extend_from_slice(&members[..n_test]);
        split
            .validation
            .extend_from_slice(&members[n_test..n_test + n_val]);
        split.train.extend_from_slice(&members[n_test + n_val..]);
    }
    split.train.shuffle(&mut rng);
    split.validation.shuffle(&mut rng);
    split.test.shuffle(&mut rng);
    split
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

impl From<&EvaluationReport> for SplitMetrics {
    fn from(report: &EvaluationReport) -> Self {
        Self {
            loss: report.loss,
            accuracy: report.accuracy,
            precision: report.precision,
            recall: report.recall,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train: SplitMetrics,
    pub validation: Option<SplitMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
    /// Epoch whose weights were kept
    pub best_epoch: usize,
    pub best_accuracy: f64,
    pub stopped_early: bool,
}

/// Everything produced by a full run.
#[derive(Debug, Clone)]
pub struct TrainedForecaster {
    pub model: ForecastModel,
    pub normalizer: FeatureNormalizer,
    pub history: TrainingHistory,
    /// Held-out test metrics; `None` when the test split is empty
    pub evaluation: Option<EvaluationReport>,
}

impl TrainedForecaster {
    pub fn into_predictor(self) -> Result<Predictor> {
        Predictor::new(self.model, self.normalizer)
    }
}

/// Counts epochs since the last strict validation-accuracy improvement.
#[derive(Debug, Clone)]
struct EarlyStopping {
    patience: usize,
    best: f64,
    stalled: usize,
}

impl EarlyStopping {
    fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::NEG_INFINITY,
            stalled: 0,
        }
    }

    /// Returns true when `accuracy` is a new best.
    fn observe(&mut self, accuracy: f64) -> bool {
        if accuracy > self.best {
            self.best = accuracy;
            self.stalled = 0;
            true
        } else {
            self.stalled += 1;
            false
        }
    }

    fn should_stop(&self) -> bool {
        self.stalled >= self.patience
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without a
/// validation-loss improvement of at least [`PLATEAU_MIN_DELTA`], never going
/// below `floor`.
#[derive(Debug, Clone)]
struct PlateauSchedule {
    patience: usize,
    factor: f64,
    floor: f64,
    best_loss: f64,
    stalled: usize,
}

impl PlateauSchedule {
    fn new(config: &TrainingConfig) -> Self {
        Self {
            patience: config.lr_patience,
            factor: config.lr_factor,
            floor: config.min_learning_rate,
            best_loss: f64::INFINITY,
            stalled: 0,
        }
    }

    /// The rate to switch to, if this epoch's `loss` completes a plateau and
    /// the floor leaves room below `current`.
    fn observe(&mut self, loss: f64, current: f64) -> Option<f64> {
        if loss < self.best_loss - PLATEAU_MIN_DELTA {
            self.best_loss = loss;
            self.stalled = 0;
            return None;
        }
        self.stalled += 1;
        if self.stalled < self.patience {
            return None;
        }
        self.stalled = 0;
        let reduced = (current * self.factor).max(self.floor);
        (reduced < current).then_some(reduced)
    }
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
    model_config: ModelConfig,
}

impl Trainer {
    pub fn new(config: TrainingConfig, model_config: ModelConfig) -> Result<Self> {
        config.validate()?;
        model_config.validate()?;
        Ok(Self {
            config,
            model_config,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Split, normalize, fit and evaluate on a synthesized corpus.
    pub fn run(&self, dataset: &Dataset) -> Result<TrainedForecaster> {
        if dataset.is_empty() {
            return Err(ForecastError::EmptyDataset);
        }
        dataset.validate()?;

        let (micro, physio) = dataset.windows();
        let all = PreparedSplit::new(micro, physio, dataset.labels())?;
        let indices = stratified_split(
            &all.labels,
            self.config.test_fraction,
            self.config.validation_fraction,
            self.config.seed,
        );
        if indices.train.is_empty() {
            return Err(ForecastError::invalid("training split is empty"));
        }
        info!(
            train = indices.train.len(),
            validation = indices.validation.len(),
            test = indices.test.len(),
            "dataset split"
        );

        let train_raw = all.select(&indices.train);
        let normalizer = FeatureNormalizer::fit(&train_raw.micro, &train_raw.physio)?;
        let train = train_raw.normalized(&normalizer)?;
        let validation = all.select(&indices.validation).normalized(&normalizer)?;
        let test = all.select(&indices.test).normalized(&normalizer)?;

        let mut model = ForecastModel::new(ModelConfig {
            sequence_length: dataset.sequence_length,
            ..self.model_config.clone()
        })?;
        info!(
            fusion = model.fusion_kind().as_str(),
            parameters = model.parameter_count(),
            "model built"
        );

        let history = self.fit(&mut model, &train, &validation)?;
        let evaluation = if test.is_empty() {
            None
        } else {
            let report = self.evaluate(&model, &test)?;
            info!(
                loss = report.loss,
                accuracy = report.accuracy,
                precision = report.precision,
                recall = report.recall,
                "test evaluation"
            );
            Some(report)
        };

        Ok(TrainedForecaster {
            model,
            normalizer,
            history,
            evaluation,
        })
    }

    /// Trains `model` in place on normalized windows and freezes it.
    pub fn fit(
        &self,
        model: &mut ForecastModel,
        train: &PreparedSplit,
        validation: &PreparedSplit,
    ) -> Result<TrainingHistory> {
        if train.is_empty() {
            return Err(ForecastError::EmptyDataset);
        }
        let cfg = &self.config;
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let mut optimizer = Adam::new(cfg.learning_rate, cfg.clip_norm);
        let mut order: Vec<usize> = (0..train.len()).collect();

        let mut history = TrainingHistory {
            best_accuracy: f64::NEG_INFINITY,
            ..TrainingHistory::default()
        };
        let mut best_model = model.clone();
        let mut stopping = EarlyStopping::new(cfg.early_stopping_patience);
        let mut schedule = PlateauSchedule::new(cfg);

        for epoch in 1..=cfg.epochs {
            order.shuffle(&mut rng);
            let mut probabilities = Vec::with_capacity(train.len());
            let mut labels = Vec::with_capacity(train.len());

            for (batch_index, chunk) in order.chunks(cfg.batch_size).enumerate() {
                let batch = train.select(chunk);
                let step = model.train_step(
                    &batch.micro,
                    &batch.physio,
                    &batch.labels,
                    &mut optimizer,
                    rng.gen(),
                )?;
                if !step.loss.is_finite() {
                    return Err(ForecastError::Diverged(format!(
                        "loss {} at epoch {epoch}, batch {batch_index}",
                        step.loss
                    )));
                }
                debug!(
                    epoch,
                    batch = batch_index,
                    loss = step.loss,
                    gradient_norm = step.gradient_norm,
                    "train step"
                );
                probabilities.extend(step.probabilities);
                labels.extend(batch.labels);
            }

            let train_metrics =
                SplitMetrics::from(&EvaluationReport::compute(&probabilities, &labels));
            let validation_metrics = if validation.is_empty() {
                None
            } else {
                Some(SplitMetrics::from(&self.evaluate(model, validation)?))
            };
            let monitored = validation_metrics.unwrap_or(train_metrics);

            info!(
                epoch,
                loss = train_metrics.loss,
                accuracy = train_metrics.accuracy,
                val_loss = monitored.loss,
                val_accuracy = monitored.accuracy,
                learning_rate = optimizer.learning_rate(),
                "epoch complete"
            );
            history.epochs.push(EpochMetrics {
                epoch,
                learning_rate: optimizer.learning_rate(),
                train: train_metrics,
                validation: validation_metrics,
            });

            if stopping.observe(monitored.accuracy) {
                history.best_accuracy = monitored.accuracy;
                history.best_epoch = epoch;
                best_model = model.clone();
            }

            let current = optimizer.learning_rate();
            if let Some(reduced) = schedule.observe(monitored.loss, current) {
                warn!(epoch, from = current, to = reduced, "reducing learning rate");
                optimizer.set_learning_rate(reduced);
            }

            if stopping.should_stop() {
                warn!(epoch, best_epoch = history.best_epoch, "early stopping");
                history.stopped_early = true;
                break;
            }
        }

        let diagnosis = crate::sanitize::diagnose_model(&best_model);
        if !diagnosis.is_healthy {
            return Err(ForecastError::Diverged(diagnosis.message));
        }
        *model = best_model;
        model.freeze();
        info!(
            best_epoch = history.best_epoch,
            best_accuracy = history.best_accuracy,
            "training finished"
        );
        Ok(history)
    }

    /// Inference-mode metrics on normalized windows.
    pub fn evaluate(
        &self,
        model: &ForecastModel,
        split: &PreparedSplit,
    ) -> Result<EvaluationReport> {
        let probabilities = model.infer_batch(&split.micro, &split.physio)?;
        Ok(EvaluationReport::compute(&probabilities, &split.labels))
    }
}
