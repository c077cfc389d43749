//! Benchmarks for the per-request hot path
//!
//! This benchmark measures:
//! - Rate limiter admission (single caller and many callers)
//! - Circuit breaker admission on a healthy provider
//! - SSE frame decoding of a typical OpenAI-style stream

use std::time::Duration;

use ai_lib_gateway::pipeline::decode::SseDecoder;
use ai_lib_gateway::resilience::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use ai_lib_gateway::ProviderIdentity;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const SSE_STREAM: &str = concat!(
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" there\"}}]}\n\n",
    "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
);

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    let cfg = RateLimiterConfig::new(Duration::from_secs(60), 16_000_000);

    let limiter = RateLimiter::new();
    group.bench_function("single_caller", |b| {
        b.iter(|| black_box(limiter.try_acquire(black_box("caller-1"), &cfg)))
    });

    let keys: Vec<String> = (0..1024).map(|i| format!("caller-{i}")).collect();
    let limiter = RateLimiter::new();
    let mut i = 0usize;
    group.bench_function("many_callers", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.try_acquire(&keys[i], &cfg))
        })
    });
    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let breaker = CircuitBreaker::new();
    let cfg = CircuitBreakerConfig::new();
    let id = ProviderIdentity::new("openai:main");

    group.bench_function("admit_and_succeed", |b| {
        b.iter(|| {
            if let Ok((permit, _)) = breaker.admit(black_box(&id), &cfg) {
                black_box(permit.succeed());
            }
        })
    });
    group.finish();
}

fn bench_sse_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("sse_decode");
    group.throughput(Throughput::Bytes(SSE_STREAM.len() as u64));

    group.bench_function("whole_stream", |b| {
        b.iter(|| {
            let mut decoder = SseDecoder::new();
            black_box(decoder.push(black_box(SSE_STREAM.as_bytes())))
        })
    });

    group.bench_function("small_chunks", |b| {
        b.iter(|| {
            let mut decoder = SseDecoder::new();
            let mut frames = 0;
            for chunk in SSE_STREAM.as_bytes().chunks(16) {
                frames += decoder.push(chunk).map(|f| f.len()).unwrap_or(0);
            }
            black_box(frames)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_rate_limiter, bench_breaker, bench_sse_decode);
criterion_main!(benches);
