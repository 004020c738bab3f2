use std::path::PathBuf;
use std::str::FromStr;

use crate::logging::LogSettings;
use crate::model::fusion::FusionKind;
use crate::model::ModelConfig;
use crate::synth::SynthesisConfig;
use crate::train::TrainingConfig;
use crate::types::LabelMode;

/// Driver settings read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    pub samples: usize,
    pub sequence_length: usize,
    pub prediction_horizon: usize,
    pub seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub fusion: FusionKind,
    pub label_mode: LabelMode,
    pub dataset_path: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    pub logging: LogSettings,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_label_mode(value: &str, persistence: f64) -> Option<LabelMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "current" => Some(LabelMode::Current),
        "horizon" => Some(LabelMode::Horizon { persistence }),
        _ => None,
    }
}

/// `ENABLE_FILE_LOGS` accepts `true`/`1`; `LOG_DIR` defaults to `./logs`.
fn log_settings(
    filter: Option<String>,
    enable_file_logs: Option<&str>,
    log_dir: Option<PathBuf>,
) -> LogSettings {
    let enabled = enable_file_logs
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1"))
        .unwrap_or(false);
    LogSettings {
        filter: filter
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "info".to_string()),
        file_dir: enabled.then(|| log_dir.unwrap_or_else(|| PathBuf::from("./logs"))),
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let fusion = std::env::var("FORECAST_FUSION")
            .ok()
            .and_then(|value| FusionKind::parse(&value))
            .unwrap_or_default();

        let persistence = env_or("FORECAST_PERSISTENCE", 0.8_f64).clamp(0.0, 1.0);
        let label_mode = std::env::var("FORECAST_LABEL_MODE")
            .ok()
            .and_then(|value| parse_label_mode(&value, persistence))
            .unwrap_or_default();

        let logging = log_settings(
            std::env::var("RUST_LOG").ok(),
            std::env::var("ENABLE_FILE_LOGS").ok().as_deref(),
            env_path("LOG_DIR"),
        );

        Self {
            samples: env_or("FORECAST_SAMPLES", 2000),
            sequence_length: env_or("FORECAST_SEQUENCE_LENGTH", 120),
            prediction_horizon: env_or("FORECAST_HORIZON", 30),
            seed: env_or("FORECAST_SEED", 42),
            epochs: env_or("FORECAST_EPOCHS", 100),
            batch_size: env_or("FORECAST_BATCH_SIZE", 32),
            learning_rate: env_or("FORECAST_LEARNING_RATE", 1e-3),
            fusion,
            label_mode,
            dataset_path: env_path("FORECAST_DATASET_PATH"),
            artifact_path: env_path("FORECAST_ARTIFACT_PATH"),
            logging,
        }
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        SynthesisConfig {
            sequence_length: self.sequence_length,
            prediction_horizon: self.prediction_horizon,
            label_mode: self.label_mode,
            seed: self.seed,
        }
    }

    pub fn model(&self) -> ModelConfig {
        ModelConfig {
            sequence_length: self.sequence_length,
            fusion: self.fusion,
            seed: self.seed.wrapping_add(1),
            ..ModelConfig::default()
        }
    }

    pub fn training(&self) -> TrainingConfig {
        TrainingConfig {
            epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.learning_rate,
            seed: self.seed.wrapping_add(2),
            ..TrainingConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_mode() {
        assert_eq!(parse_label_mode("current", 0.5), Some(LabelMode::Current));
        assert_eq!(
            parse_label_mode(" Horizon ", 0.5),
            Some(LabelMode::Horizon { persistence: 0.5 })
        );
        assert_eq!(parse_label_mode("future", 0.5), None);
    }

    #[test]
    fn test_log_settings() {
        assert_eq!(log_settings(None, None, None), LogSettings::default());
        assert_eq!(
            log_settings(Some("  ".to_string()), Some("false"), Some(PathBuf::from("/tmp/x"))),
            LogSettings::default()
        );

        let settings = log_settings(Some("debug".to_string()), Some(" TRUE "), None);
        assert_eq!(settings.filter, "debug");
        assert_eq!(settings.file_dir, Some(PathBuf::from("./logs")));

        let settings = log_settings(None, Some("1"), Some(PathBuf::from("/var/log/forecast")));
        assert_eq!(settings.file_dir, Some(PathBuf::from("/var/log/forecast")));
    }

    #[test]
    fn test_derived_configs_use_distinct_seeds() {
        let config = Config {
            samples: 10,
            sequence_length: 64,
            prediction_horizon: 8,
            seed: 7,
            epochs: 3,
            batch_size: 4,
            learning_rate: 0.01,
            fusion: FusionKind::Projection,
            label_mode: LabelMode::Current,
            dataset_path: None,
            artifact_path: None,
            logging: LogSettings::default(),
        };
        assert_eq!(config.synthesis().seed, 7);
        assert_eq!(config.model().seed, 8);
        assert_eq!(config.training().seed, 9);
        assert_eq!(config.model().sequence_length, 64);
        assert_eq!(config.model().fusion, FusionKind::Projection);
        assert_eq!(config.training().epochs, 3);
    }
}
