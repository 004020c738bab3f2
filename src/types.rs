use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::matrix::Matrix;

// Channel layout
pub const MICRO_CHANNELS: usize = 12;
pub const PHYSIO_CHANNELS: usize = 8;
pub const NUM_EMOTIONS: usize = 7;

/// Facial action-unit channel names, in feature-column order
pub const MICRO_CHANNEL_NAMES: [&str; MICRO_CHANNELS] = [
    "AU1", "AU2", "AU4", "AU5", "AU6", "AU7", "AU9", "AU10", "AU12", "AU15", "AU17", "AU20",
];

/// Physiological channel names, in feature-column order
pub const PHYSIO_CHANNEL_NAMES: [&str; PHYSIO_CHANNELS] = [
    "heart_rate",
    "heart_rate_variability",
    "skin_conductance",
    "skin_temperature",
    "respiration_rate",
    "pupil_diameter",
    "blink_rate",
    "systolic_blood_pressure",
];

/// Column indices of the facial action units.
pub mod au {
    /// Inner brow raiser
    pub const AU1: usize = 0;
    /// Outer brow raiser
    pub const AU2: usize = 1;
    /// Brow lowerer
    pub const AU4: usize = 2;
    /// Upper lid raiser
    pub const AU5: usize = 3;
    /// Cheek raiser
    pub const AU6: usize = 4;
    /// Lid tightener
    pub const AU7: usize = 5;
    /// Nose wrinkler
    pub const AU9: usize = 6;
    /// Upper lip raiser
    pub const AU10: usize = 7;
    /// Lip corner puller
    pub const AU12: usize = 8;
    /// Lip corner depressor
    pub const AU15: usize = 9;
    /// Chin raiser
    pub const AU17: usize = 10;
    /// Lip stretcher
    pub const AU20: usize = 11;
}

/// Column indices of the physiological channels.
pub mod physio {
    pub const HEART_RATE: usize = 0;
    pub const HRV: usize = 1;
    pub const SKIN_CONDUCTANCE: usize = 2;
    pub const SKIN_TEMPERATURE: usize = 3;
    pub const RESPIRATION_RATE: usize = 4;
    pub const PUPIL_DIAMETER: usize = 5;
    pub const BLINK_RATE: usize = 6;
    pub const SYSTOLIC_BP: usize = 7;
}

/// Forecast target; the discriminant is the vocabulary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fear,
    Surprise,
    Disgust,
}

impl Emotion {
    /// Fixed vocabulary order shared by training and inference.
    pub const ALL: [Emotion; NUM_EMOTIONS] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Fear,
        Emotion::Surprise,
        Emotion::Disgust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Fear => "fear",
            Self::Surprise => "surprise",
            Self::Disgust => "disgust",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "neutral" => Some(Self::Neutral),
            "happy" => Some(Self::Happy),
            "sad" => Some(Self::Sad),
            "angry" => Some(Self::Angry),
            "fear" => Some(Self::Fear),
            "surprise" => Some(Self::Surprise),
            "disgust" => Some(Self::Disgust),
            _ => None,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Uniform draw from the vocabulary.
    pub fn sample<R: Rng>(rng: &mut R) -> Self {
        Self::ALL[rng.gen_range(0..NUM_EMOTIONS)]
    }

    pub fn vocabulary() -> Vec<String> {
        Self::ALL.iter().map(|e| e.as_str().to_string()).collect()
    }

    /// Fails unless `names` lists the vocabulary in the fixed order.
    pub fn check_vocabulary(names: &[String]) -> Result<()> {
        let expected = Self::vocabulary();
        if names != expected.as_slice() {
            return Err(ForecastError::VocabularyMismatch {
                expected,
                actual: names.to_vec(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two time-aligned sequences and their emotion label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// `(sequence_length + prediction_horizon) × 12`, values in [0, 1]
    pub micro: Matrix,
    /// `(sequence_length + prediction_horizon) × 8`
    pub physio: Matrix,
    pub emotion: Emotion,
}

impl Sample {
    /// First `sequence_length` frames of both modalities, the part the model consumes.
    pub fn window(&self, sequence_length: usize) -> (Matrix, Matrix) {
        (
            self.micro.head_rows(sequence_length),
            self.physio.head_rows(sequence_length),
        )
    }

    pub fn validate(&self, frames: usize) -> Result<()> {
        check_shape("micro sequence", &self.micro, frames, MICRO_CHANNELS)?;
        check_shape("physio sequence", &self.physio, frames, PHYSIO_CHANNELS)
    }
}

/// How the label of a synthetic sample relates to its frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LabelMode {
    /// Label is the emotion of the observed window.
    #[default]
    Current,
    /// Label is the emotion in force over the prediction horizon, which keeps the
    /// window's emotion with probability `persistence`.
    Horizon { persistence: f64 },
}

impl LabelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Current => "current",
            Self::Horizon { .. } => "horizon",
        }
    }
}

/// A synthesized corpus with the settings needed to reproduce it.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub label_mode: LabelMode,
    pub seed: u64,
    pub samples: Vec<Sample>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> Vec<Emotion> {
        self.samples.iter().map(|s| s.emotion).collect()
    }

    /// Model windows (first `sequence_length` frames) for every sample.
    pub fn windows(&self) -> (Vec<Matrix>, Vec<Matrix>) {
        self.samples
            .iter()
            .map(|s| s.window(self.sequence_length))
            .unzip()
    }

    /// Full sequences and labels as three aligned collections.
    pub fn into_parts(self) -> (Vec<Matrix>, Vec<Matrix>, Vec<Emotion>) {
        let mut micro = Vec::with_capacity(self.samples.len());
        let mut physio = Vec::with_capacity(self.samples.len());
        let mut labels = Vec::with_capacity(self.samples.len());
        for sample in self.samples {
            micro.push(sample.micro);
            physio.push(sample.physio);
            labels.push(sample.emotion);
        }
        (micro, physio, labels)
    }

    pub fn validate(&self) -> Result<()> {
        let frames = self.sequence_length + self.prediction_horizon;
        for sample in &self.samples {
            sample.validate(frames)?;
        }
        Ok(())
    }
}

/// Result of one prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub emotion: Emotion,
    /// Probability of `emotion`, in [0, 1]
    pub confidence: f64,
    /// Probability of every vocabulary emotion keyed by name
    pub probabilities: BTreeMap<String, f64>,
    /// Same probabilities in vocabulary order
    pub distribution: Vec<f64>,
}

impl Prediction {
    pub fn from_distribution(distribution: Vec<f64>) -> Self {
        let best = crate::matrix::argmax(&distribution);
        let probabilities = Emotion::ALL
            .iter()
            .zip(distribution.iter())
            .map(|(e, &p)| (e.as_str().to_string(), p))
            .collect();
        Self {
            emotion: Emotion::ALL[best],
            confidence: distribution[best],
            probabilities,
            distribution,
        }
    }
}

pub(crate) fn check_shape(
    what: &'static str,
    m: &Matrix,
    rows: usize,
    cols: usize,
) -> Result<()> {
    if m.rows() != rows || m.cols() != cols {
        return Err(ForecastError::ShapeMismatch {
            what,
            expected_rows: rows,
            expected_cols: cols,
            actual_rows: m.rows(),
            actual_cols: m.cols(),
        });
    }
    Ok(())
}
