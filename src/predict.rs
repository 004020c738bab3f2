use crate::error::{ForecastError, Result};
use crate::matrix::Matrix;
use crate::model::ForecastModel;
use crate::normalize::FeatureNormalizer;
use crate::types::{check_shape, Prediction, Sample, MICRO_CHANNELS, PHYSIO_CHANNELS};

/// Fitted normalizer plus trained model, read-only once built.
///
/// `predict` takes `&self`, so one predictor can serve concurrent callers
/// (`Predictor` is `Send + Sync`).
#[derive(Debug, Clone)]
pub struct Predictor {
    model: ForecastModel,
    normalizer: FeatureNormalizer,
}

impl Predictor {
    pub fn new(model: ForecastModel, normalizer: FeatureNormalizer) -> Result<Self> {
        if !model.is_trained() {
            return Err(ForecastError::ModelUnavailable);
        }
        normalizer.validate()?;
        Ok(Self { model, normalizer })
    }

    pub fn model(&self) -> &ForecastModel {
        &self.model
    }

    pub fn normalizer(&self) -> &FeatureNormalizer {
        &self.normalizer
    }

    pub fn sequence_length(&self) -> usize {
        self.model.config().sequence_length
    }

    /// Raw (unnormalized) aligned windows in, forecast out.
    pub fn predict(&self, micro: &Matrix, physio: &Matrix) -> Result<Prediction> {
        let len = self.sequence_length();
        check_shape("micro window", micro, len, MICRO_CHANNELS)?;
        check_shape("physio window", physio, len, PHYSIO_CHANNELS)?;
        let (micro, physio) = self.normalizer.transform(micro, physio)?;
        self.model.predict(&micro, &physio)
    }

    /// Forecast from the observed window of a synthesized sample.
    pub fn predict_sample(&self, sample: &Sample) -> Result<Prediction> {
        let (micro, physio) = sample.window(self.sequence_length());
        self.predict(&micro, &physio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fusion::FusionKind;
    use crate::model::ModelConfig;

    fn parts(trained: bool) -> (ForecastModel, FeatureNormalizer) {
        let mut model = ForecastModel::new(ModelConfig {
            sequence_length: 8,
            micro_conv_channels: vec![4, 4],
            physio_conv_channels: vec![4, 4],
            micro_projection: 4,
            branch_lstm_units: 4,
            fusion: FusionKind::Projection,
            projection_width: 4,
            fusion_dense_units: 4,
            fusion_lstm_units: 4,
            head_units: 4,
            head_hidden_units: 4,
            ..ModelConfig::default()
        })
        .unwrap();
        if trained {
            model.freeze();
        }
        let micro = vec![Matrix::filled(8, MICRO_CHANNELS, 0.2)];
        let physio = vec![Matrix::filled(8, PHYSIO_CHANNELS, 60.0)];
        (model, FeatureNormalizer::fit(&micro, &physio).unwrap())
    }

    #[test]
    fn test_untrained_model_is_rejected() {
        let (model, normalizer) = parts(false);
        assert!(matches!(
            Predictor::new(model, normalizer),
            Err(ForecastError::ModelUnavailable)
        ));
    }

    #[test]
    fn test_wrong_length_window_is_rejected() {
        let (model, normalizer) = parts(true);
        let predictor = Predictor::new(model, normalizer).unwrap();
        let result = predictor.predict(
            &Matrix::zeros(9, MICRO_CHANNELS),
            &Matrix::zeros(9, PHYSIO_CHANNELS),
        );
        assert!(matches!(
            result,
            Err(ForecastError::ShapeMismatch {
                expected_rows: 8,
                actual_rows: 9,
                ..
            })
        ));
    }

    #[test]
    fn test_concurrent_predictions_agree() {
        let (model, normalizer) = parts(true);
        let predictor = Predictor::new(model, normalizer).unwrap();
        let micro = Matrix::filled(8, MICRO_CHANNELS, 0.3);
        let physio = Matrix::filled(8, PHYSIO_CHANNELS, 75.0);
        let expected = predictor.predict(&micro, &physio).unwrap();

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| predictor.predict(&micro, &physio).unwrap()))
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap(), expected);
            }
        });
    }
}
