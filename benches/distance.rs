use std::hint::black_box;

use cellsearch::MetricKind;
use cellsearch::distance::distance_unchecked;
use cellsearch::knn::TopK;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;

const DIM: usize = 40;

fn random_vectors(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n * DIM).map(|_| rng.random_range(-5.0..5.0f32)).collect()
}

fn bench_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("Distance");
    let mut rng = StdRng::seed_from_u64(0);
    let query = random_vectors(&mut rng, 1);
    let data = random_vectors(&mut rng, 1 << 14);

    group.throughput(Throughput::Elements((data.len() / DIM) as u64));
    for metric in MetricKind::ALL {
        group.bench_function(metric.as_str(), |b| {
            b.iter(|| {
                data.chunks_exact(DIM)
                    .map(|point| distance_unchecked(&query, point, black_box(metric)))
                    .sum::<f64>()
            });
        });
    }
    group.finish();
}

fn bench_topk(c: &mut Criterion) {
    let mut group = c.benchmark_group("TopK");
    let mut rng = StdRng::seed_from_u64(1);
    let distances = (0..1 << 16).map(|_| rng.random::<f64>()).collect::<Vec<_>>();

    group.throughput(Throughput::Elements(distances.len() as u64));
    for k in [10, 100, 1000] {
        group.bench_function(format!("k={k}"), |b| {
            b.iter(|| {
                let mut top = TopK::new(black_box(k));
                for (i, &d) in distances.iter().enumerate() {
                    top.push(i, d);
                }
                top.into_sorted_vec()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_distance, bench_topk);
criterion_main!(benches);
