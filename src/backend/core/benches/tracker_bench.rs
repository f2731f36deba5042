//! Benchmarks for the dependency tracker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use facet_core::config::TrackerConfig;
use facet_core::definition::DependencySpec;
use facet_core::tracker::DependencyTracker;

fn build_chain(n: usize) -> DependencyTracker {
    let tracker = DependencyTracker::new(TrackerConfig {
        max_depth: n + 1,
        max_dependencies_per_attribute: n + 1,
        ..Default::default()
    });
    for i in 1..n {
        tracker
            .add_edge(&format!("attr-{i}"), DependencySpec::attribute(format!("attr-{}", i - 1)))
            .unwrap();
    }
    tracker
}

fn build_fanout(fan: usize) -> DependencyTracker {
    let tracker = DependencyTracker::new(TrackerConfig {
        max_dependencies_per_attribute: fan + 1,
        ..Default::default()
    });
    for i in 0..fan {
        tracker
            .add_edge(&format!("leaf-{i}"), DependencySpec::attribute("root"))
            .unwrap();
    }
    tracker
}

fn bench_add_edge(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_add_edge");
    for n in [10usize, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter_batched(
                || build_chain(n),
                |tracker| {
                    tracker
                        .add_edge("fresh", DependencySpec::attribute(format!("attr-{}", n - 1)))
                        .unwrap();
                    black_box(tracker)
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_affected(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_affected");
    for fan in [10usize, 100, 1_000] {
        let tracker = build_fanout(fan);
        group.bench_with_input(BenchmarkId::from_parameter(fan), &tracker, |b, tracker| {
            b.iter(|| black_box(tracker.affected("root")));
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_resolve");
    for n in [10usize, 100, 500] {
        let tracker = build_chain(n);
        let top = format!("attr-{}", n - 1);
        group.bench_with_input(BenchmarkId::from_parameter(n), &tracker, |b, tracker| {
            b.iter(|| black_box(tracker.resolve(&[top.as_str()]).unwrap()));
        });
    }
    group.finish();
}

fn bench_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker_depth");
    for n in [10usize, 100] {
        let tracker = build_chain(n);
        let top = format!("attr-{}", n - 1);
        group.bench_with_input(BenchmarkId::from_parameter(n), &tracker, |b, tracker| {
            b.iter(|| black_box(tracker.depth(&top)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_add_edge, bench_affected, bench_resolve, bench_depth);
criterion_main!(benches);
