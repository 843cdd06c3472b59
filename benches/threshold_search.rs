use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use forensic_fusion::{
    config::ThresholdConfig,
    evaluation::metrics::TargetMetric,
    training::{TieBreak, select_threshold, threshold_grid},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

fn scored_split(n: usize) -> (Vec<u8>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(7);
    let y_true: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
    let y_prob = y_true
        .iter()
        .map(|&y| (0.35 + 0.3 * y as f64 + rng.gen_range(-0.3..0.3)).clamp(0.0, 1.0))
        .collect();
    (y_true, y_prob)
}

fn bench_threshold_search(c: &mut Criterion) {
    let (y_true, y_prob) = scored_split(2_000);
    let training_grid = threshold_grid(&ThresholdConfig::default());
    let tuning_grid = threshold_grid(&ThresholdConfig::tuning());

    c.bench_function("f1 threshold, 81 steps, 2k rows", |b| {
        b.iter(|| {
            select_threshold(
                black_box(&y_true),
                black_box(&y_prob),
                &training_grid,
                TargetMetric::F1,
                TieBreak::LowestThreshold,
            )
        })
    });

    c.bench_function("f1 threshold, 161 steps, 2k rows", |b| {
        b.iter(|| {
            select_threshold(
                black_box(&y_true),
                black_box(&y_prob),
                &tuning_grid,
                TargetMetric::F1,
                TieBreak::LowestThreshold,
            )
        })
    });
}

criterion_group!(benches, bench_threshold_search);
criterion_main!(benches);
