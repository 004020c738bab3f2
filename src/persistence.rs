//! JSON files for synthetic corpora and trained artifacts.
//!
//! Both formats record the vocabulary order they were written with; loading
//! refuses files whose vocabulary differs from the running build.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ForecastError, Result};
use crate::model::ForecastModel;
use crate::normalize::FeatureNormalizer;
use crate::predict::Predictor;
use crate::types::{Dataset, Emotion, LabelMode, Sample};

/// Bumped whenever the artifact layout changes incompatibly.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub vocabulary: Vec<String>,
    pub label_mode: LabelMode,
    pub seed: u64,
    pub samples: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetFile {
    metadata: DatasetMetadata,
    samples: Vec<Sample>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string(value)?;
    fs::write(path, payload)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_dataset(dataset: &Dataset, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = DatasetFile {
        metadata: DatasetMetadata {
            sequence_length: dataset.sequence_length,
            prediction_horizon: dataset.prediction_horizon,
            vocabulary: Emotion::vocabulary(),
            label_mode: dataset.label_mode,
            seed: dataset.seed,
            samples: dataset.len(),
        },
        samples: dataset.samples.clone(),
    };
    write_json(path, &file)?;
    info!(path = %path.display(), samples = dataset.len(), "saved dataset");
    Ok(())
}

/// Reads a dataset file, checking vocabulary order, sample count and
/// per-sample alignment of both modalities.
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Dataset> {
    let path = path.as_ref();
    let file: DatasetFile = read_json(path)?;
    Emotion::check_vocabulary(&file.metadata.vocabulary)?;
    if file.samples.len() != file.metadata.samples {
        return Err(ForecastError::invalid(format!(
            "dataset metadata lists {} samples, file holds {}",
            file.metadata.samples,
            file.samples.len()
        )));
    }

    let dataset = Dataset {
        sequence_length: file.metadata.sequence_length,
        prediction_horizon: file.metadata.prediction_horizon,
        label_mode: file.metadata.label_mode,
        seed: file.metadata.seed,
        samples: file.samples,
    };
    dataset.validate()?;
    info!(path = %path.display(), samples = dataset.len(), "loaded dataset");
    Ok(dataset)
}

/// Trained model plus the normalizer it was trained behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub vocabulary: Vec<String>,
    pub model: ForecastModel,
    pub normalizer: FeatureNormalizer,
}

impl ModelArtifact {
    pub fn new(model: ForecastModel, normalizer: FeatureNormalizer) -> Result<Self> {
        if !model.is_trained() {
            return Err(ForecastError::ModelUnavailable);
        }
        Ok(Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            vocabulary: Emotion::vocabulary(),
            model,
            normalizer,
        })
    }

    pub fn from_predictor(predictor: &Predictor) -> Result<Self> {
        Self::new(predictor.model().clone(), predictor.normalizer().clone())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write_json(path, self)?;
        info!(
            path = %path.display(),
            fusion = self.model.fusion_kind().as_str(),
            "saved model artifact"
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let artifact: Self = read_json(path.as_ref())?;
        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ForecastError::invalid(format!(
                "unsupported artifact format version {}",
                artifact.format_version
            )));
        }
        Emotion::check_vocabulary(&artifact.vocabulary)?;
        artifact.normalizer.validate()?;
        artifact.model.config().validate()?;
        Ok(artifact)
    }

    pub fn into_predictor(self) -> Result<Predictor> {
        Predictor::new(self.model, self.normalizer)
    }
}
