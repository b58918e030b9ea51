//! Backoff computation cost across attempt counts and jitter settings.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deliverd::config::RetryConfig;
use deliverd::observability::default_observer;
use deliverd::retry_manager::RetryManager;
use deliverd::storage::memory::InMemoryQueueRepository;

fn manager(jitter_enabled: bool) -> RetryManager {
    let repo = Arc::new(InMemoryQueueRepository::default());
    let config = RetryConfig {
        jitter_enabled,
        ..RetryConfig::default()
    };
    RetryManager::new(repo, config, default_observer())
}

fn bench_calculate_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("calculate_backoff");

    let with_jitter = manager(true);
    let without_jitter = manager(false);

    for attempt in [1u32, 4, 8, 16, 32] {
        group.bench_with_input(BenchmarkId::new("jitter", attempt), &attempt, |b, &attempt| {
            b.iter(|| black_box(with_jitter.calculate_backoff(attempt)));
        });
        group.bench_with_input(BenchmarkId::new("no_jitter", attempt), &attempt, |b, &attempt| {
            b.iter(|| black_box(without_jitter.calculate_backoff(attempt)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_calculate_backoff);
criterion_main!(benches);
