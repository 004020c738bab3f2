use std::process::ExitCode;

use emotion_forecast::config::Config;
use emotion_forecast::logging::init_tracing;
use emotion_forecast::{
    load_dataset, save_dataset, Dataset, ModelArtifact, Result, SequenceSynthesizer, Trainer,
};

fn load_or_synthesize(config: &Config) -> Result<Dataset> {
    if let Some(path) = config.dataset_path.as_ref().filter(|p| p.exists()) {
        let dataset = load_dataset(path)?;
        if dataset.sequence_length != config.sequence_length {
            tracing::warn!(
                file = dataset.sequence_length,
                configured = config.sequence_length,
                "dataset sequence length overrides configuration"
            );
        }
        return Ok(dataset);
    }

    let mut synthesizer = SequenceSynthesizer::new(config.synthesis())?;
    let dataset = synthesizer.generate_dataset(config.samples)?;
    if let Some(path) = &config.dataset_path {
        save_dataset(&dataset, path)?;
    }
    Ok(dataset)
}

fn run(config: &Config) -> Result<()> {
    let dataset = load_or_synthesize(config)?;
    let trainer = Trainer::new(config.training(), config.model())?;
    let trained = trainer.run(&dataset)?;

    if let Some(report) = &trained.evaluation {
        tracing::info!(
            accuracy = report.accuracy,
            precision = report.precision,
            recall = report.recall,
            "held-out evaluation"
        );
        println!("{}", report.report);
        println!("{}", report.confusion);
    }

    if let Some(path) = &config.artifact_path {
        ModelArtifact::new(trained.model, trained.normalizer)?.save(path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.logging);

    tracing::info!(
        samples = config.samples,
        sequence_length = config.sequence_length,
        horizon = config.prediction_horizon,
        fusion = config.fusion.as_str(),
        label_mode = config.label_mode.as_str(),
        "emotion-forecast starting"
    );

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "pipeline failed");
            ExitCode::FAILURE
        }
    }
}
