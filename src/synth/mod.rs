//! Synthetic multi-modal sequence generation.
//!
//! Each sample draws one emotion, then walks `sequence_length + prediction_horizon`
//! time steps. Micro-expression frames follow first-order exponential smoothing
//! over independent template draws and are clamped to [0, 1]; physiology frames
//! are independent draws around emotion-shifted baselines.

pub mod templates;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ForecastError, Result};
use crate::matrix::{Matrix, EPSILON};
use crate::types::{
    Dataset, Emotion, LabelMode, Sample, MICRO_CHANNELS, NUM_EMOTIONS, PHYSIO_CHANNELS,
};

pub use templates::{ChannelTemplate, EmotionTemplate, SignalTemplateLibrary};

/// Weight of the previous micro frame
pub const SMOOTHING_MEMORY: f64 = 0.7;
/// Weight of the fresh template draw
pub const SMOOTHING_INNOVATION: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub label_mode: LabelMode,
    pub seed: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            sequence_length: 120,
            prediction_horizon: 30,
            label_mode: LabelMode::Current,
            seed: 42,
        }
    }
}

impl SynthesisConfig {
    pub fn total_frames(&self) -> usize {
        self.sequence_length + self.prediction_horizon
    }

    pub fn validate(&self) -> Result<()> {
        if self.sequence_length == 0 {
            return Err(ForecastError::invalid("sequence_length must be positive"));
        }
        if self.prediction_horizon == 0 {
            return Err(ForecastError::invalid("prediction_horizon must be positive"));
        }
        if let LabelMode::Horizon { persistence } = self.label_mode {
            if !(0.0..=1.0).contains(&persistence) {
                return Err(ForecastError::invalid(format!(
                    "persistence must lie in [0, 1], got {persistence}"
                )));
            }
        }
        Ok(())
    }
}

/// Standard normal draw using the Box-Muller transform.
pub fn sample_standard_normal<R: Rng>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen::<f64>().max(EPSILON);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

pub fn sample_normal<R: Rng>(rng: &mut R, template: &ChannelTemplate) -> f64 {
    template.mean + template.std_dev * sample_standard_normal(rng)
}

/// One smoothing step: `0.7 * previous + 0.3 * raw`, clamped to [0, 1].
pub fn smooth_micro_frame(previous: &[f64], raw: &[f64]) -> Vec<f64> {
    previous
        .iter()
        .zip(raw.iter())
        .map(|(&p, &r)| (SMOOTHING_MEMORY * p + SMOOTHING_INNOVATION * r).clamp(0.0, 1.0))
        .collect()
}

pub struct SequenceSynthesizer {
    config: SynthesisConfig,
    library: SignalTemplateLibrary,
    rng: ChaCha8Rng,
}

impl SequenceSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self> {
        Self::with_library(config, SignalTemplateLibrary::standard())
    }

    pub fn with_library(config: SynthesisConfig, library: SignalTemplateLibrary) -> Result<Self> {
        config.validate()?;
        if !library.is_complete() {
            return Err(ForecastError::invalid(format!(
                "template library must define {NUM_EMOTIONS} emotions in vocabulary order"
            )));
        }
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            library,
            rng,
        })
    }

    pub fn config(&self) -> &SynthesisConfig {
        &self.config
    }

    pub fn library(&self) -> &SignalTemplateLibrary {
        &self.library
    }

    /// Produces `n_samples` aligned (micro sequence, physio sequence, label) triples
    /// as three equal-length collections.
    pub fn generate(&mut self, n_samples: usize) -> Result<(Vec<Matrix>, Vec<Matrix>, Vec<Emotion>)> {
        Ok(self.generate_dataset(n_samples)?.into_parts())
    }

    pub fn generate_dataset(&mut self, n_samples: usize) -> Result<Dataset> {
        if n_samples == 0 {
            return Err(ForecastError::invalid("n_samples must be positive"));
        }

        let samples: Vec<Sample> = (0..n_samples).map(|_| self.synthesize_sample()).collect();

        let mut counts = [0usize; NUM_EMOTIONS];
        for sample in &samples {
            counts[sample.emotion.index()] += 1;
        }
        info!(
            n_samples,
            sequence_length = self.config.sequence_length,
            prediction_horizon = self.config.prediction_horizon,
            label_mode = self.config.label_mode.as_str(),
            ?counts,
            "synthesized dataset"
        );

        Ok(Dataset {
            sequence_length: self.config.sequence_length,
            prediction_horizon: self.config.prediction_horizon,
            label_mode: self.config.label_mode,
            seed: self.config.seed,
            samples,
        })
    }

    /// Draws a single sample, advancing the generator.
    pub fn synthesize_sample(&mut self) -> Sample {
        let onset = Emotion::sample(&mut self.rng);
        let label = match self.config.label_mode {
            LabelMode::Current => onset,
            LabelMode::Horizon { persistence } => {
                draw_target_emotion(&mut self.rng, onset, persistence)
            }
        };

        let window = self.config.sequence_length;
        let total = self.config.total_frames();
        let mut micro = Matrix::zeros(total, MICRO_CHANNELS);
        let mut physio = Matrix::zeros(total, PHYSIO_CHANNELS);
        let mut previous: Option<Vec<f64>> = None;

        for t in 0..total {
            let emotion = if t < window { onset } else { label };

            let raw = self.library.draw_micro_frame(emotion, &mut self.rng);
            let frame = match &previous {
                Some(prev) => smooth_micro_frame(prev, &raw),
                None => raw.iter().map(|v| v.clamp(0.0, 1.0)).collect(),
            };
            micro.row_mut(t).copy_from_slice(&frame);
            previous = Some(frame);

            let physio_frame = self.library.draw_physio_frame(emotion, &mut self.rng);
            physio.row_mut(t).copy_from_slice(&physio_frame);
        }

        if onset != label {
            debug!(onset = %onset, target = %label, "emotion transition inside horizon");
        }

        Sample {
            micro,
            physio,
            emotion: label,
        }
    }
}

/// Keeps `onset` with probability `persistence`, otherwise moves uniformly to one
/// of the other emotions.
pub fn draw_target_emotion<R: Rng>(rng: &mut R, onset: Emotion, persistence: f64) -> Emotion {
    if rng.gen::<f64>() < persistence {
        return onset;
    }
    let offset = rng.gen_range(1..NUM_EMOTIONS);
    Emotion::ALL[(onset.index() + offset) % NUM_EMOTIONS]
}

impl SignalTemplateLibrary {
    /// Raw (unsmoothed, unclamped) micro-expression frame for `emotion`.
    pub fn draw_micro_frame<R: Rng>(&self, emotion: Emotion, rng: &mut R) -> Vec<f64> {
        self.micro(emotion)
            .iter()
            .map(|channel| sample_normal(rng, channel))
            .collect()
    }

    pub fn draw_physio_frame<R: Rng>(&self, emotion: Emotion, rng: &mut R) -> Vec<f64> {
        self.physiology(emotion)
            .iter()
            .map(|channel| sample_normal(rng, channel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{au, physio};

    fn config(seed: u64) -> SynthesisConfig {
        SynthesisConfig {
            sequence_length: 40,
            prediction_horizon: 10,
            label_mode: LabelMode::Current,
            seed,
        }
    }

    #[test]
    fn test_generate_returns_aligned_collections() {
        let mut synth = SequenceSynthesizer::new(config(1)).unwrap();
        let (micro, physio, labels) = synth.generate(12).unwrap();
        assert_eq!(micro.len(), 12);
        assert_eq!(physio.len(), 12);
        assert_eq!(labels.len(), 12);
        for (m, p) in micro.iter().zip(physio.iter()) {
            assert_eq!(m.shape(), (50, MICRO_CHANNELS));
            assert_eq!(p.shape(), (50, PHYSIO_CHANNELS));
        }
    }

    #[test]
    fn test_rejects_invalid_parameters_before_drawing() {
        let mut synth = SequenceSynthesizer::new(config(1)).unwrap();
        assert!(matches!(
            synth.generate(0),
            Err(ForecastError::InvalidParameter(_))
        ));

        let mut bad = config(1);
        bad.sequence_length = 0;
        assert!(SequenceSynthesizer::new(bad).is_err());

        let mut bad = config(1);
        bad.prediction_horizon = 0;
        assert!(SequenceSynthesizer::new(bad).is_err());

        let mut bad = config(1);
        bad.label_mode = LabelMode::Horizon { persistence: 1.5 };
        assert!(SequenceSynthesizer::new(bad).is_err());
    }

    #[test]
    fn test_micro_values_are_clamped() {
        let mut synth = SequenceSynthesizer::new(config(2)).unwrap();
        let dataset = synth.generate_dataset(30).unwrap();
        for sample in &dataset.samples {
            assert!(sample
                .micro
                .as_slice()
                .iter()
                .all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_smoothing_identity_holds_on_replayed_draws() {
        let cfg = config(7);
        let library = SignalTemplateLibrary::standard();
        let mut synth = SequenceSynthesizer::new(cfg.clone()).unwrap();
        let sample = synth.synthesize_sample();

        // Replay the exact draw order with the same seed
        let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
        let emotion = Emotion::sample(&mut rng);
        assert_eq!(emotion, sample.emotion);

        for t in 0..cfg.total_frames() {
            let raw = library.draw_micro_frame(emotion, &mut rng);
            let physio_frame = library.draw_physio_frame(emotion, &mut rng);
            assert_eq!(sample.physio.row(t), physio_frame.as_slice());

            for c in 0..MICRO_CHANNELS {
                let expected = if t == 0 {
                    raw[c].clamp(0.0, 1.0)
                } else {
                    let prev = sample.micro[(t - 1, c)];
                    (0.7 * prev + 0.3 * raw[c]).clamp(0.0, 1.0)
                };
                assert_eq!(sample.micro[(t, c)], expected);
            }
        }
    }

    #[test]
    fn test_same_seed_same_dataset() {
        let a = SequenceSynthesizer::new(config(11))
            .unwrap()
            .generate_dataset(5)
            .unwrap();
        let b = SequenceSynthesizer::new(config(11))
            .unwrap()
            .generate_dataset(5)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_heart_rate_tracks_emotion() {
        let mut synth = SequenceSynthesizer::new(config(5)).unwrap();
        let dataset = synth.generate_dataset(70).unwrap();
        for sample in &dataset.samples {
            let n = sample.physio.rows() as f64;
            let mean_hr: f64 = (0..sample.physio.rows())
                .map(|t| sample.physio[(t, physio::HEART_RATE)])
                .sum::<f64>()
                / n;
            let baseline = synth.library().template(sample.emotion).heart_rate;
            assert!((mean_hr - baseline).abs() < 3.5, "{mean_hr} vs {baseline}");
        }
    }

    #[test]
    fn test_horizon_mode_switches_template_after_window() {
        let cfg = SynthesisConfig {
            sequence_length: 60,
            prediction_horizon: 60,
            label_mode: LabelMode::Horizon { persistence: 0.0 },
            seed: 3,
        };
        let mut synth = SequenceSynthesizer::new(cfg).unwrap();
        let library = SignalTemplateLibrary::standard();

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let onset = Emotion::sample(&mut rng);
        let target = draw_target_emotion(&mut rng, onset, 0.0);
        assert_ne!(onset, target);

        let sample = synth.synthesize_sample();
        assert_eq!(sample.emotion, target);

        // heart rate in the horizon follows the target baseline
        let horizon_hr: f64 = (60..120).map(|t| sample.physio[(t, physio::HEART_RATE)]).sum::<f64>() / 60.0;
        assert!((horizon_hr - library.template(target).heart_rate).abs() < 3.0);
    }

    #[test]
    fn test_draw_target_emotion_never_repeats_without_persistence() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..200 {
            let onset = Emotion::sample(&mut rng);
            assert_ne!(draw_target_emotion(&mut rng, onset, 0.0), onset);
            assert_eq!(draw_target_emotion(&mut rng, onset, 1.0), onset);
        }
    }

    #[test]
    fn test_standard_normal_moments() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let draws: Vec<f64> = (0..20_000).map(|_| sample_standard_normal(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!(mean.abs() < 0.05);
        assert!((var - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_happy_frames_raise_cheeks() {
        let library = SignalTemplateLibrary::standard();
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let frame = library.draw_micro_frame(Emotion::Happy, &mut rng);
        assert_eq!(frame.len(), MICRO_CHANNELS);
        assert!(frame[au::AU12] > frame[au::AU4]);
    }
}
