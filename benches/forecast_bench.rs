use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use emotion_forecast::matrix::Matrix;
use emotion_forecast::model::optim::Adam;
use emotion_forecast::{
    Emotion, FeatureNormalizer, ForecastModel, LabelMode, ModelConfig, SequenceSynthesizer,
    SynthesisConfig, Trainer, TrainingConfig,
};

fn synthesis_config(sequence_length: usize) -> SynthesisConfig {
    SynthesisConfig {
        sequence_length,
        prediction_horizon: 30,
        label_mode: LabelMode::Current,
        seed: 42,
    }
}

fn bench_synthesis(c: &mut Criterion) {
    let mut group = c.benchmark_group("synthesize_32_samples");
    for sequence_length in [60, 120, 240] {
        group.bench_with_input(
            BenchmarkId::from_parameter(sequence_length),
            &sequence_length,
            |b, &len| {
                b.iter(|| {
                    let mut synth = SequenceSynthesizer::new(synthesis_config(len)).unwrap();
                    black_box(synth.generate_dataset(32).unwrap())
                })
            },
        );
    }
    group.finish();
}

fn windows(n: usize) -> (Vec<Matrix>, Vec<Matrix>, Vec<Emotion>) {
    let mut synth = SequenceSynthesizer::new(synthesis_config(120)).unwrap();
    let dataset = synth.generate_dataset(n).unwrap();
    let labels = dataset.labels();
    let (micro, physio) = dataset.windows();
    let normalizer = FeatureNormalizer::fit(&micro, &physio).unwrap();
    let (micro, physio) = normalizer.transform_batch(&micro, &physio).unwrap();
    (micro, physio, labels)
}

fn bench_inference(c: &mut Criterion) {
    let mut synth = SequenceSynthesizer::new(synthesis_config(120)).unwrap();
    let dataset = synth.generate_dataset(56).unwrap();
    let training = TrainingConfig {
        epochs: 1,
        batch_size: 16,
        ..TrainingConfig::default()
    };
    let predictor = Trainer::new(training, ModelConfig::default())
        .unwrap()
        .run(&dataset)
        .unwrap()
        .into_predictor()
        .unwrap();
    let (micro, physio) = dataset.samples[0].window(120);

    c.bench_function("predict_single_window", |b| {
        b.iter(|| black_box(predictor.predict(&micro, &physio).unwrap()))
    });
}

fn bench_train_step(c: &mut Criterion) {
    let (micro, physio, labels) = windows(16);
    let mut model = ForecastModel::new(ModelConfig::default()).unwrap();
    let mut optimizer = Adam::new(1e-3, Some(5.0));
    let mut step = 0u64;

    c.bench_function("train_step_batch_16", |b| {
        b.iter(|| {
            step += 1;
            black_box(
                model
                    .train_step(&micro, &physio, &labels, &mut optimizer, step)
                    .unwrap(),
            )
        })
    });
}

criterion_group!(benches, bench_synthesis, bench_inference, bench_train_step);
criterion_main!(benches);
