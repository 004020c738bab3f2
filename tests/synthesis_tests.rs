//! Integration tests for the synthetic corpus
//!
//! - every micro-expression value is clamped to [0, 1]
//! - emotion templates show up in the channel means of generated frames
//! - the first `sequence_length` frames are the model window

mod common;

use proptest::prelude::*;

use emotion_forecast::types::{au, MICRO_CHANNELS, PHYSIO_CHANNELS};
use emotion_forecast::{Emotion, FeatureNormalizer, LabelMode, SequenceSynthesizer, SynthesisConfig};

fn channel_means(samples: &[&emotion_forecast::Sample]) -> Vec<f64> {
    let mut sums = vec![0.0; MICRO_CHANNELS];
    let mut frames = 0usize;
    for sample in samples {
        for row in sample.micro.row_iter() {
            for (s, v) in sums.iter_mut().zip(row) {
                *s += v;
            }
            frames += 1;
        }
    }
    sums.iter().map(|s| s / frames as f64).collect()
}

#[test]
fn test_channel_means_follow_templates() {
    let dataset = common::synthesize(9000, 20, 5, 2024);
    let happy: Vec<_> = dataset
        .samples
        .iter()
        .filter(|s| s.emotion == Emotion::Happy)
        .take(1000)
        .collect();
    let neutral: Vec<_> = dataset
        .samples
        .iter()
        .filter(|s| s.emotion == Emotion::Neutral)
        .take(1000)
        .collect();
    assert_eq!(happy.len(), 1000);
    assert_eq!(neutral.len(), 1000);

    let happy_means = channel_means(&happy);
    assert!(happy_means[au::AU6] > 0.5, "AU6 {}", happy_means[au::AU6]);
    assert!(happy_means[au::AU12] > 0.5, "AU12 {}", happy_means[au::AU12]);

    let neutral_means = channel_means(&neutral);
    for (c, mean) in neutral_means.iter().enumerate() {
        assert!(*mean < 0.1, "neutral channel {c} mean {mean}");
    }
}

#[test]
fn test_labels_cover_vocabulary() {
    let dataset = common::synthesize(700, 10, 2, 5);
    let labels = dataset.labels();
    for emotion in Emotion::ALL {
        let count = labels.iter().filter(|&&l| l == emotion).count();
        assert!(count > 60, "{emotion} drawn {count} times");
    }
}

#[test]
fn test_windows_drop_horizon_frames() {
    let dataset = common::synthesize(4, 16, 6, 1);
    let (micro, physio) = dataset.windows();
    for ((m, p), sample) in micro.iter().zip(&physio).zip(&dataset.samples) {
        assert_eq!(m.shape(), (16, MICRO_CHANNELS));
        assert_eq!(p.shape(), (16, PHYSIO_CHANNELS));
        assert_eq!(sample.micro.rows(), 22);
        assert_eq!(m.row(15), sample.micro.row(15));
    }
}

#[test]
fn test_normalizer_fitted_on_corpus_standardizes_it() {
    let dataset = common::synthesize(50, 30, 5, 8);
    let (micro, physio) = dataset.windows();
    let normalizer = FeatureNormalizer::fit(&micro, &physio).unwrap();
    let (_, normalized) = normalizer.transform_batch(&micro, &physio).unwrap();

    let frames = (normalized.len() * 30) as f64;
    for c in 0..PHYSIO_CHANNELS {
        let mean: f64 = normalized
            .iter()
            .flat_map(|m| m.row_iter().map(move |r| r[c]))
            .sum::<f64>()
            / frames;
        assert!(mean.abs() < 1e-9);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_micro_values_stay_in_unit_interval(
        seed in any::<u64>(),
        sequence_length in 1usize..40,
        horizon in 1usize..10,
        persistence in 0.0f64..=1.0,
        horizon_mode in any::<bool>(),
    ) {
        let label_mode = if horizon_mode {
            LabelMode::Horizon { persistence }
        } else {
            LabelMode::Current
        };
        let mut synthesizer = SequenceSynthesizer::new(SynthesisConfig {
            sequence_length,
            prediction_horizon: horizon,
            label_mode,
            seed,
        })
        .unwrap();
        let (micro, physio, labels) = synthesizer.generate(8).unwrap();
        prop_assert_eq!(micro.len(), labels.len());
        prop_assert_eq!(physio.len(), labels.len());
        for m in &micro {
            prop_assert_eq!(m.rows(), sequence_length + horizon);
            prop_assert!(m.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }
}
