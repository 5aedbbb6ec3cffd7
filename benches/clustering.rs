//! Performance benchmarks for reply clustering and coverage.
//!
//! Run with: `cargo bench --bench clustering`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Cluster 100k messages | <100ms | Full recomputation per query |
//! | Gaps over 100k ids | <10ms | Linear in stored ids |
//! | Hybrid stats | <150ms | Clustering plus aggregation |

use std::collections::BTreeSet;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use archive_kernel::{
    compute_gaps, ChannelId, HybridAttribution, Message, MessageId, NativeTopicId,
    ReplyGraphBuilder, StatsView,
};
use chrono::{TimeZone, Utc};

const CHANNEL: ChannelId = ChannelId::new(-100);

/// A channel where every message replies to one of the previous 50, with
/// a fresh thread every 20 messages and every tenth message in a forum topic.
fn make_history(n: i64) -> Vec<Message> {
    (1..=n)
        .map(|id| {
            let reply_to = (id % 20 != 0 && id > 1).then(|| id - 1 - (id * 7919) % 50i64.min(id - 1));
            Message::new(
                CHANNEL,
                MessageId::new(id),
                Some(id % 97),
                Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
                "bench",
            )
            .with_reply_to(reply_to.map(MessageId::new))
            .with_native_topic((id % 10 == 0).then(|| NativeTopicId::new(id % 3)))
        })
        .collect()
}

/// Benchmark full reply-graph recomputation.
fn bench_clustering(c: &mut Criterion) {
    let mut group = c.benchmark_group("clustering");

    for size in [1_000i64, 10_000, 100_000] {
        let history = make_history(size);
        let builder = ReplyGraphBuilder::new(CHANNEL);
        let absent = BTreeSet::new();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("messages", size), &history, |b, history| {
            b.iter(|| {
                let graph = builder.build(black_box(history), &absent);
                assert!(!graph.is_empty());
                graph
            })
        });
    }

    group.finish();
}

/// Benchmark gap computation with sparse holes and absent ids.
fn bench_gaps(c: &mut Criterion) {
    let mut group = c.benchmark_group("gaps");

    for size in [1_000i64, 10_000, 100_000] {
        let stored: Vec<MessageId> = (1..=size).filter(|id| id % 13 != 0).map(MessageId::new).collect();
        let absent: BTreeSet<MessageId> = (1..=size).filter(|id| id % 26 == 0).map(MessageId::new).collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("ids", size), &stored, |b, stored| {
            b.iter(|| compute_gaps(black_box(stored), &absent))
        });
    }

    group.finish();
}

/// Benchmark hybrid attribution and per-topic stats.
fn bench_hybrid_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_stats");

    for size in [1_000i64, 10_000, 100_000] {
        let history = make_history(size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("messages", size), &history, |b, history| {
            b.iter(|| {
                let graph = ReplyGraphBuilder::new(CHANNEL).build(black_box(history), &BTreeSet::new());
                HybridAttribution::merge(history, &graph).stats(history, StatsView::Hybrid)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_clustering, bench_gaps, bench_hybrid_stats);
criterion_main!(benches);
