//! Per-channel standardization fitted once on the training corpus.
//!
//! Every frame of every sequence is one observation of each channel. The
//! fitted statistics are immutable and must be reused for every later
//! transform; applying them to a different channel count is an error.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::matrix::Matrix;
use crate::types::{MICRO_CHANNELS, PHYSIO_CHANNELS};

/// Standard deviations below this count as constant channels.
const MIN_STD: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    mean: Vec<f64>,
    /// Population standard deviation, 1 for constant channels
    scale: Vec<f64>,
    /// Frames seen while fitting
    frames: usize,
}

impl NormalizationStats {
    pub fn fit(sequences: &[Matrix]) -> Result<Self> {
        let channels = sequences.first().map(Matrix::cols).unwrap_or(0);
        let frames: usize = sequences.iter().map(Matrix::rows).sum();
        if frames == 0 || channels == 0 {
            return Err(ForecastError::EmptyDataset);
        }
        if let Some(bad) = sequences.iter().find(|s| s.cols() != channels) {
            return Err(ForecastError::NormalizerMismatch {
                expected: channels,
                actual: bad.cols(),
            });
        }

        let n = frames as f64;
        let mut mean = vec![0.0; channels];
        for seq in sequences {
            for row in seq.row_iter() {
                crate::matrix::vec_add_scaled(&mut mean, row, 1.0);
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut variance = vec![0.0; channels];
        for seq in sequences {
            for row in seq.row_iter() {
                for (v, (&x, &m)) in variance.iter_mut().zip(row.iter().zip(&mean)) {
                    *v += (x - m) * (x - m);
                }
            }
        }
        let scale = variance
            .iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > MIN_STD {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self {
            mean,
            scale,
            frames,
        })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    /// `(x - mean) / scale` per channel, identical for every frame.
    pub fn transform(&self, sequence: &Matrix) -> Result<Matrix> {
        if sequence.cols() != self.channels() {
            return Err(ForecastError::NormalizerMismatch {
                expected: self.channels(),
                actual: sequence.cols(),
            });
        }
        let mut out = sequence.clone();
        for r in 0..out.rows() {
            for (c, v) in out.row_mut(r).iter_mut().enumerate() {
                *v = (*v - self.mean[c]) / self.scale[c];
            }
        }
        Ok(out)
    }

    pub fn transform_all(&self, sequences: &[Matrix]) -> Result<Vec<Matrix>> {
        sequences.par_iter().map(|s| self.transform(s)).collect()
    }
}

/// Fitted statistics for both modalities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureNormalizer {
    micro: NormalizationStats,
    physio: NormalizationStats,
}

impl FeatureNormalizer {
    pub fn fit(micro: &[Matrix], physio: &[Matrix]) -> Result<Self> {
        let normalizer = Self {
            micro: NormalizationStats::fit(micro)?,
            physio: NormalizationStats::fit(physio)?,
        };
        normalizer.validate()?;
        Ok(normalizer)
    }

    pub fn micro(&self) -> &NormalizationStats {
        &self.micro
    }

    pub fn physio(&self) -> &NormalizationStats {
        &self.physio
    }

    /// Channel counts must match the modality layout.
    pub fn validate(&self) -> Result<()> {
        for (stats, expected) in [(&self.micro, MICRO_CHANNELS), (&self.physio, PHYSIO_CHANNELS)] {
            if stats.channels() != expected {
                return Err(ForecastError::NormalizerMismatch {
                    expected,
                    actual: stats.channels(),
                });
            }
        }
        Ok(())
    }

    pub fn transform(&self, micro: &Matrix, physio: &Matrix) -> Result<(Matrix, Matrix)> {
        Ok((self.micro.transform(micro)?, self.physio.transform(physio)?))
    }

    pub fn transform_batch(
        &self,
        micro: &[Matrix],
        physio: &[Matrix],
    ) -> Result<(Vec<Matrix>, Vec<Matrix>)> {
        Ok((
            self.micro.transform_all(micro)?,
            self.physio.transform_all(physio)?,
        ))
    }
}
