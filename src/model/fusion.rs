//! Fusion of the two branch encodings into one sequence.
//!
//! Both inputs must share length and width. The variant is fixed when the
//! model is built and travels with the serialized parameters.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::attention::{AttentionCache, MultiHeadAttention};
use super::layers::{Activation, Dense, DenseCache, Parameterized, SampleLayer};
use crate::error::{ForecastError, Result};
use crate::matrix::Matrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FusionKind {
    /// Self-attention per branch plus micro→physio cross-attention
    #[default]
    Attention,
    /// Position-wise tanh projection per branch
    Projection,
}

impl FusionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attention => "attention",
            Self::Projection => "projection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attention" => Some(Self::Attention),
            "projection" => Some(Self::Projection),
            _ => None,
        }
    }

    /// The variant actually built in this binary.
    pub fn resolve(self) -> Self {
        match self {
            Self::Attention if cfg!(feature = "multihead-attention") => Self::Attention,
            Self::Attention => {
                warn!("multi-head attention not compiled in, using projection fusion");
                Self::Projection
            }
            Self::Projection => {
                warn!("projection fusion selected");
                Self::Projection
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FusionStage {
    Attention {
        micro_self: MultiHeadAttention,
        physio_self: MultiHeadAttention,
        cross: MultiHeadAttention,
    },
    Projection {
        micro: Dense,
        physio: Dense,
    },
}

#[derive(Debug, Clone)]
pub enum FusionCache {
    Attention {
        micro_self: AttentionCache,
        physio_self: AttentionCache,
        cross: AttentionCache,
    },
    Projection {
        micro: DenseCache,
        physio: DenseCache,
    },
}

impl FusionCache {
    pub fn kind(&self) -> FusionKind {
        match self {
            Self::Attention { .. } => FusionKind::Attention,
            Self::Projection { .. } => FusionKind::Projection,
        }
    }
}

impl FusionStage {
    /// `width` is the shared branch width.
    pub fn new<R: Rng>(
        kind: FusionKind,
        width: usize,
        heads: usize,
        head_dim: usize,
        dropout: f64,
        projection_width: usize,
        rng: &mut R,
    ) -> Self {
        match kind.resolve() {
            FusionKind::Attention => Self::Attention {
                micro_self: MultiHeadAttention::new(width, width, heads, head_dim, dropout, rng),
                physio_self: MultiHeadAttention::new(width, width, heads, head_dim, dropout, rng),
                cross: MultiHeadAttention::new(width, width, heads, head_dim, dropout, rng),
            },
            FusionKind::Projection => Self::Projection {
                micro: Dense::new(width, projection_width, Activation::Tanh, rng),
                physio: Dense::new(width, projection_width, Activation::Tanh, rng),
            },
        }
    }

    pub fn kind(&self) -> FusionKind {
        match self {
            Self::Attention { .. } => FusionKind::Attention,
            Self::Projection { .. } => FusionKind::Projection,
        }
    }

    pub fn output_width(&self) -> usize {
        match self {
            Self::Attention {
                micro_self,
                physio_self,
                cross,
            } => micro_self.output_dim() + physio_self.output_dim() + cross.output_dim(),
            Self::Projection { micro, physio } => micro.output_dim() + physio.output_dim(),
        }
    }

    /// Channel-wise concatenation of the fused blocks; dropout only with `rng`.
    pub fn forward(
        &self,
        micro: &Matrix,
        physio: &Matrix,
        mut rng: Option<&mut ChaCha8Rng>,
    ) -> (Matrix, FusionCache) {
        match self {
            Self::Attention {
                micro_self,
                physio_self,
                cross,
            } => {
                let (a, micro_cache) = micro_self.forward(micro, micro, rng.as_deref_mut());
                let (b, physio_cache) = physio_self.forward(physio, physio, rng.as_deref_mut());
                let (c, cross_cache) = cross.forward(micro, physio, rng.as_deref_mut());
                (
                    Matrix::hconcat(&[&a, &b, &c]),
                    FusionCache::Attention {
                        micro_self: micro_cache,
                        physio_self: physio_cache,
                        cross: cross_cache,
                    },
                )
            }
            Self::Projection {
                micro: micro_dense,
                physio: physio_dense,
            } => {
                let (a, micro_cache) = micro_dense.forward_sample(micro);
                let (b, physio_cache) = physio_dense.forward_sample(physio);
                (
                    Matrix::hconcat(&[&a, &b]),
                    FusionCache::Projection {
                        micro: micro_cache,
                        physio: physio_cache,
                    },
                )
            }
        }
    }

    pub fn infer(&self, micro: &Matrix, physio: &Matrix) -> Matrix {
        self.forward(micro, physio, None).0
    }

    /// Returns `(d_micro, d_physio, parameter gradients)`. The cache must come
    /// from a stage of the same kind.
    pub fn backward(
        &self,
        cache: &FusionCache,
        grad_output: &Matrix,
    ) -> Result<(Matrix, Matrix, Vec<Matrix>)> {
        match (self, cache) {
            (
                Self::Attention {
                    micro_self,
                    physio_self,
                    cross,
                },
                FusionCache::Attention {
                    micro_self: micro_cache,
                    physio_self: physio_cache,
                    cross: cross_cache,
                },
            ) => {
                let parts = grad_output.split_columns(&[
                    micro_self.output_dim(),
                    physio_self.output_dim(),
                    cross.output_dim(),
                ]);
                let (mq, mkv, mut grads) = micro_self.backward(micro_cache, &parts[0]);
                let (pq, pkv, physio_grads) = physio_self.backward(physio_cache, &parts[1]);
                let (cq, ckv, cross_grads) = cross.backward(cross_cache, &parts[2]);
                grads.extend(physio_grads);
                grads.extend(cross_grads);

                let mut grad_micro = mq;
                grad_micro.add_assign(&mkv);
                grad_micro.add_assign(&cq);
                let mut grad_physio = pq;
                grad_physio.add_assign(&pkv);
                grad_physio.add_assign(&ckv);
                Ok((grad_micro, grad_physio, grads))
            }
            (
                Self::Projection { micro, physio },
                FusionCache::Projection {
                    micro: micro_cache,
                    physio: physio_cache,
                },
            ) => {
                let parts = grad_output.split_columns(&[micro.output_dim(), physio.output_dim()]);
                let (grad_micro, mut grads) = micro.backward_sample(micro_cache, &parts[0]);
                let (grad_physio, physio_grads) = physio.backward_sample(physio_cache, &parts[1]);
                grads.extend(physio_grads);
                Ok((grad_micro, grad_physio, grads))
            }
            (stage, _) => Err(ForecastError::invalid(format!(
                "fusion cache does not match {} fusion stage",
                stage.kind().as_str()
            ))),
        }
    }
}

impl Parameterized for FusionStage {
    fn parameters(&self) -> Vec<&Matrix> {
        match self {
            Self::Attention {
                micro_self,
                physio_self,
                cross,
            } => {
                let mut params = micro_self.parameters();
                params.extend(physio_self.parameters());
                params.extend(cross.parameters());
                params
            }
            Self::Projection { micro, physio } => {
                let mut params = micro.parameters();
                params.extend(physio.parameters());
                params
            }
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Matrix> {
        match self {
            Self::Attention {
                micro_self,
                physio_self,
                cross,
            } => {
                let mut params = micro_self.parameters_mut();
                params.extend(physio_self.parameters_mut());
                params.extend(cross.parameters_mut());
                params
            }
            Self::Projection { micro, physio } => {
                let mut params = micro.parameters_mut();
                params.extend(physio.parameters_mut());
                params
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::layers::gradcheck::*;
    use super::*;
    use rand::SeedableRng;

    fn inputs(rng: &mut ChaCha8Rng) -> (Matrix, Matrix) {
        (
            Matrix::glorot_uniform(4, 6, rng),
            Matrix::glorot_uniform(4, 6, rng),
        )
    }

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in [FusionKind::Attention, FusionKind::Projection] {
            assert_eq!(FusionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(FusionKind::parse(" Projection "), Some(FusionKind::Projection));
        assert_eq!(FusionKind::parse("concat"), None);
    }

    #[test]
    fn test_projection_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let stage = FusionStage::new(FusionKind::Projection, 6, 2, 3, 0.1, 5, &mut rng);
        assert_eq!(stage.kind(), FusionKind::Projection);
        assert_eq!(stage.output_width(), 10);
        let (micro, physio) = inputs(&mut rng);
        assert_eq!(stage.infer(&micro, &physio).shape(), (4, 10));
    }

    #[cfg(feature = "multihead-attention")]
    #[test]
    fn test_attention_width_is_three_branch_widths() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let stage = FusionStage::new(FusionKind::Attention, 6, 2, 3, 0.1, 5, &mut rng);
        assert_eq!(stage.kind(), FusionKind::Attention);
        assert_eq!(stage.output_width(), 18);
    }

    #[cfg(not(feature = "multihead-attention"))]
    #[test]
    fn test_attention_falls_back_without_feature() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let stage = FusionStage::new(FusionKind::Attention, 6, 2, 3, 0.1, 5, &mut rng);
        assert_eq!(stage.kind(), FusionKind::Projection);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        for kind in [FusionKind::Attention, FusionKind::Projection] {
            let mut rng = ChaCha8Rng::seed_from_u64(3);
            let stage = FusionStage::new(kind, 6, 2, 3, 0.1, 5, &mut rng);
            let (micro, physio) = inputs(&mut rng);
            let r = Matrix::glorot_uniform(4, stage.output_width(), &mut rng);

            let (_, cache) = stage.forward(&micro, &physio, None);
            let (grad_micro, grad_physio, grads) = stage.backward(&cache, &r).unwrap();

            check_matrix(&mut micro.clone(), &grad_micro, "fusion micro", |m| {
                weighted_sum(&stage.infer(m, &physio), &r)
            });
            check_matrix(&mut physio.clone(), &grad_physio, "fusion physio", |p| {
                weighted_sum(&stage.infer(&micro, p), &r)
            });
            assert_eq!(grads.len(), stage.parameters().len());
        }
    }

    #[cfg(feature = "multihead-attention")]
    #[test]
    fn test_backward_rejects_cache_from_other_kind() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let attention = FusionStage::new(FusionKind::Attention, 6, 2, 3, 0.1, 5, &mut rng);
        let projection = FusionStage::new(FusionKind::Projection, 6, 2, 3, 0.1, 5, &mut rng);
        let (micro, physio) = inputs(&mut rng);

        let (_, projection_cache) = projection.forward(&micro, &physio, None);
        let r = Matrix::glorot_uniform(4, attention.output_width(), &mut rng);
        assert!(matches!(
            attention.backward(&projection_cache, &r),
            Err(ForecastError::InvalidParameter(_))
        ));

        let (_, attention_cache) = attention.forward(&micro, &physio, None);
        let r = Matrix::glorot_uniform(4, projection.output_width(), &mut rng);
        assert!(projection.backward(&attention_cache, &r).is_err());
    }
}
