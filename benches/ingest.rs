//! Ingestion and rendering benchmarks
//!
//! - Observation ingestion per prior size (update cost is linear in atoms)
//! - Frame rendering per grid resolution
//! - Full pipeline into an in-memory archive

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use martingale_posteriors::archive::MemoryFrameArchive;
use martingale_posteriors::checkpoint::CheckpointPolicy;
use martingale_posteriors::config::ExperimentConfig;
use martingale_posteriors::engine::{MartingaleEngine, PosteriorState, PriorConfig};
use martingale_posteriors::observation::{Observation, OutcomeModel};
use martingale_posteriors::pipeline::Experiment;
use martingale_posteriors::render::{FrameRenderer, GridScale, GridSpec};

const STREAM: u64 = 10_000;

fn outcome(seq: u64) -> (&'static str, f64) {
    let arm = if seq % 2 == 0 { "A" } else { "B" };
    (arm, if seq % 3 == 0 { 1.0 } else { 0.0 })
}

fn engine(atoms: usize) -> MartingaleEngine {
    let prior = PriorConfig::Normal {
        mean: 0.0,
        scale: 1.0,
        atoms,
    };
    let engine = MartingaleEngine::new(OutcomeModel::Binary, prior.build().unwrap());
    engine.register_arm("A").unwrap();
    engine.register_arm("B").unwrap();
    engine.register_comparison("A", "B").unwrap();
    engine
}

fn warmed_state() -> PosteriorState {
    let engine = engine(41);
    for seq in 0..1_000 {
        let (arm, value) = outcome(seq);
        engine.ingest(&Observation::new(arm, value, seq)).unwrap();
    }
    engine.close().pop().unwrap()
}

/// Benchmark raw engine ingestion
fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");

    for atoms in [11, 41, 161].iter() {
        let observations: Vec<Observation> = (0..STREAM)
            .map(|seq| {
                let (arm, value) = outcome(seq);
                Observation::new(arm, value, seq)
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(atoms), atoms, |b, &atoms| {
            b.iter(|| {
                let engine = engine(atoms);
                for observation in &observations {
                    engine.ingest(observation).unwrap();
                }
                black_box(engine);
            });
        });
    }

    group.finish();
}

/// Benchmark frame rendering
fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");
    let state = warmed_state();
    let renderer = FrameRenderer::default();

    for resolution in [32, 128, 512].iter() {
        let grid = GridSpec::new(0.25, 4.0, *resolution, GridScale::Log);
        group.bench_with_input(BenchmarkId::from_parameter(resolution), &grid, |b, grid| {
            b.iter(|| black_box(renderer.render(&state, grid).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark the full pipeline with checkpointing
fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    for every in [10u64, 100, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(every), every, |b, &every| {
            b.iter(|| {
                let config = ExperimentConfig::builder("bench")
                    .arm("A")
                    .arm("B")
                    .checkpoint(CheckpointPolicy::Stride { every })
                    .build()
                    .unwrap();
                let experiment = Experiment::new(config, MemoryFrameArchive::new()).unwrap();
                for seq in 0..STREAM {
                    let (arm, value) = outcome(seq);
                    experiment.observe(arm, value).unwrap();
                }
                black_box(experiment.close().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ingest, bench_render, bench_pipeline);
criterion_main!(benches);
