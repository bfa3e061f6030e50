use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use subtyper::filter::{CorrelationPruner, correlation_matrix};
use subtyper::synthetic::SyntheticSpec;

fn bench_pruning(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation_pruning");
    let pruner = CorrelationPruner::new(0.9).expect("valid cutoff");

    for &features in &[100usize, 250, 500] {
        let dataset = SyntheticSpec {
            samples_per_class: 100,
            features,
            informative: 10,
            shift: 1.0,
            correlated_copies: features / 10,
            seed: 7,
        }
        .generate()
        .expect("synthetic study");
        let candidates = dataset.feature_set();

        group.bench_with_input(
            BenchmarkId::new("correlation_matrix", features),
            &dataset,
            |b, ds| b.iter(|| correlation_matrix(black_box(ds.values().view()))),
        );
        group.bench_with_input(BenchmarkId::new("prune", features), &dataset, |b, ds| {
            b.iter(|| pruner.prune(black_box(ds), black_box(&candidates)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pruning);
criterion_main!(benches);
