//! Benchmarks for failure classification and retry decisions.
//!
//! Run with: cargo bench --bench retry_bench

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use ingest_core::jobs::{classify, BackoffStrategy, RetryPolicy};
use ingest_core::sync::SyncError;

fn sample_errors() -> Vec<(&'static str, SyncError)> {
    vec![
        (
            "rate_limited",
            SyncError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
        ),
        (
            "server",
            SyncError::Server {
                status: 502,
                message: "bad gateway".to_string(),
            },
        ),
        ("timeout", SyncError::Timeout("read timed out".to_string())),
        ("unauthorized", SyncError::Unauthorized("revoked".to_string())),
        (
            "sync_failed",
            SyncError::SyncFailed {
                message: "source schema changed".to_string(),
            },
        ),
    ]
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    for (label, error) in sample_errors() {
        group.bench_with_input(BenchmarkId::from_parameter(label), &error, |b, e| {
            b.iter(|| black_box(classify(e)));
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_delay");
    let strategies = [
        ("fixed", BackoffStrategy::fixed(Duration::from_secs(30))),
        (
            "exponential",
            BackoffStrategy::exponential(Duration::from_secs(30), Duration::from_secs(1800), 2.0),
        ),
        ("exponential_jitter", BackoffStrategy::default()),
    ];
    for (label, strategy) in strategies {
        group.bench_with_input(BenchmarkId::from_parameter(label), &strategy, |b, s| {
            b.iter(|| {
                for attempt in 0..8 {
                    black_box(s.delay_for_attempt(attempt));
                }
            });
        });
    }
    group.finish();
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_decide");
    let policy = RetryPolicy::default();
    let errors = sample_errors();

    for batch in [100usize, 1_000] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &n| {
            let now = Utc::now();
            b.iter(|| {
                for i in 0..n {
                    let (_, error) = &errors[i % errors.len()];
                    black_box(policy.decide((i % 7) as u32, error, now));
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify, bench_backoff, bench_decide);
criterion_main!(benches);
