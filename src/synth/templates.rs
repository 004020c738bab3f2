//! Per-emotion signal templates.
//!
//! Every emotion maps to one (mean, stddev) pair per micro-expression channel,
//! a heart-rate baseline and a respiration offset. The synthesizer consults the
//! table uniformly, so a new emotion is a new row here and nothing else.

use serde::{Deserialize, Serialize};

use crate::types::{au, physio, Emotion, MICRO_CHANNELS, NUM_EMOTIONS, PHYSIO_CHANNELS};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelTemplate {
    pub mean: f64,
    pub std_dev: f64,
}

impl ChannelTemplate {
    pub const fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }
}

/// Resting facial channel for a non-neutral emotion
const QUIET: ChannelTemplate = ChannelTemplate::new(0.05, 0.05);
/// Neutral face: near zero with small noise
const REST: ChannelTemplate = ChannelTemplate::new(0.05, 0.03);

pub const HEART_RATE_STD_DEV: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionTemplate {
    pub emotion: Emotion,
    pub micro: [ChannelTemplate; MICRO_CHANNELS],
    pub heart_rate: f64,
    pub respiration_offset: f64,
}

impl EmotionTemplate {
    fn new(
        emotion: Emotion,
        base: ChannelTemplate,
        active: &[(usize, f64, f64)],
        heart_rate: f64,
        respiration_offset: f64,
    ) -> Self {
        let mut micro = [base; MICRO_CHANNELS];
        for &(channel, mean, std_dev) in active {
            micro[channel] = ChannelTemplate::new(mean, std_dev);
        }
        Self {
            emotion,
            micro,
            heart_rate,
            respiration_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTemplateLibrary {
    emotions: Vec<EmotionTemplate>,
    /// Baselines of the physiological channels; heart rate and respiration are
    /// shifted per emotion.
    physiology: [ChannelTemplate; PHYSIO_CHANNELS],
}

impl Default for SignalTemplateLibrary {
    fn default() -> Self {
        Self::standard()
    }
}

impl SignalTemplateLibrary {
    pub fn standard() -> Self {
        use Emotion::*;

        let emotions = vec![
            EmotionTemplate::new(Neutral, REST, &[], 70.0, 0.0),
            EmotionTemplate::new(
                Happy,
                QUIET,
                &[
                    (au::AU6, 0.7, 0.15),
                    (au::AU7, 0.3, 0.1),
                    (au::AU12, 0.8, 0.15),
                ],
                85.0,
                2.0,
            ),
            EmotionTemplate::new(
                Sad,
                QUIET,
                &[
                    (au::AU1, 0.6, 0.15),
                    (au::AU4, 0.4, 0.1),
                    (au::AU15, 0.7, 0.15),
                    (au::AU17, 0.4, 0.1),
                ],
                65.0,
                -2.0,
            ),
            EmotionTemplate::new(
                Angry,
                QUIET,
                &[
                    (au::AU4, 0.8, 0.15),
                    (au::AU5, 0.3, 0.1),
                    (au::AU7, 0.7, 0.15),
                    (au::AU9, 0.5, 0.15),
                    (au::AU17, 0.4, 0.1),
                ],
                90.0,
                4.0,
            ),
            EmotionTemplate::new(
                Fear,
                QUIET,
                &[
                    (au::AU1, 0.7, 0.15),
                    (au::AU2, 0.6, 0.15),
                    (au::AU4, 0.3, 0.1),
                    (au::AU5, 0.8, 0.15),
                    (au::AU20, 0.6, 0.15),
                ],
                90.0,
                4.0,
            ),
            EmotionTemplate::new(
                Surprise,
                QUIET,
                &[
                    (au::AU1, 0.8, 0.15),
                    (au::AU2, 0.8, 0.15),
                    (au::AU5, 0.7, 0.15),
                ],
                85.0,
                2.0,
            ),
            EmotionTemplate::new(
                Disgust,
                QUIET,
                &[
                    (au::AU9, 0.8, 0.15),
                    (au::AU10, 0.7, 0.15),
                    (au::AU15, 0.3, 0.1),
                    (au::AU17, 0.3, 0.1),
                ],
                65.0,
                0.0,
            ),
        ];

        let mut physiology = [ChannelTemplate::new(0.0, 1.0); PHYSIO_CHANNELS];
        physiology[physio::HEART_RATE] = ChannelTemplate::new(70.0, HEART_RATE_STD_DEV);
        physiology[physio::HRV] = ChannelTemplate::new(50.0, 10.0);
        physiology[physio::SKIN_CONDUCTANCE] = ChannelTemplate::new(5.0, 1.5);
        physiology[physio::SKIN_TEMPERATURE] = ChannelTemplate::new(33.0, 0.5);
        physiology[physio::RESPIRATION_RATE] = ChannelTemplate::new(16.0, 2.0);
        physiology[physio::PUPIL_DIAMETER] = ChannelTemplate::new(4.0, 0.5);
        physiology[physio::BLINK_RATE] = ChannelTemplate::new(17.0, 4.0);
        physiology[physio::SYSTOLIC_BP] = ChannelTemplate::new(120.0, 10.0);

        Self {
            emotions,
            physiology,
        }
    }

    pub fn template(&self, emotion: Emotion) -> &EmotionTemplate {
        &self.emotions[emotion.index()]
    }

    pub fn micro(&self, emotion: Emotion) -> &[ChannelTemplate; MICRO_CHANNELS] {
        &self.template(emotion).micro
    }

    /// Physiological channel distributions with the emotion's heart-rate baseline
    /// and respiration offset applied.
    pub fn physiology(&self, emotion: Emotion) -> [ChannelTemplate; PHYSIO_CHANNELS] {
        let template = self.template(emotion);
        let mut channels = self.physiology;
        channels[physio::HEART_RATE].mean = template.heart_rate;
        channels[physio::RESPIRATION_RATE].mean += template.respiration_offset;
        channels
    }

    pub fn len(&self) -> usize {
        self.emotions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emotions.is_empty()
    }

    /// The table must hold exactly one row per vocabulary entry, in order.
    pub fn is_complete(&self) -> bool {
        self.emotions.len() == NUM_EMOTIONS
            && self
                .emotions
                .iter()
                .zip(Emotion::ALL.iter())
                .all(|(t, e)| t.emotion == *e)
    }
}
