//! Golden tests for the archive kernel.
//!
//! These tests pin the two reference scenarios end to end: coverage and
//! gap settlement, and reply-chain clustering across a late parent fetch.

use std::sync::Arc;

use archive_kernel::{
    ChannelContext, ChannelId, FetchSequencer, FetchTask, HybridTopicAggregator, IdRange,
    InMemoryChatClient, InMemoryMessageStore, Message, MessageId, MessageStore, ReplyGraphBuilder,
    RootKind, StatsView, TopicRef, VirtualTopicId,
};
use chrono::{TimeZone, Utc};

const CHANNEL: ChannelId = ChannelId::new(-1001593560584);

// ─────────────────────────────────────────────────────────────────────────────
// Test Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn make_message(id: i64, reply_to: Option<i64>) -> Message {
    Message::new(
        CHANNEL,
        MessageId::new(id),
        Some(1000 + id % 3),
        Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap(),
        format!("message {}", id),
    )
    .with_reply_to(reply_to.map(MessageId::new))
}

fn make_sequencer(
    stored: Vec<Message>,
    upstream: Vec<Message>,
) -> FetchSequencer<InMemoryMessageStore, InMemoryChatClient> {
    FetchSequencer::new(
        Arc::new(InMemoryMessageStore::with_messages(stored)),
        Arc::new(InMemoryChatClient::with_messages(upstream)),
    )
}

fn range(start: i64, end: i64) -> IdRange {
    IdRange::new(MessageId::new(start), MessageId::new(end)).unwrap()
}

fn ids(raw: &[i64]) -> Vec<MessageId> {
    raw.iter().copied().map(MessageId::new).collect()
}

fn example_one_stored() -> Vec<Message> {
    [1, 2, 3, 7, 8, 10].into_iter().map(|id| make_message(id, None)).collect()
}

/// Upstream of example one: id 5 was deleted.
fn example_one_upstream() -> Vec<Message> {
    (1..=10).filter(|&id| id != 5).map(|id| make_message(id, None)).collect()
}

fn example_two() -> Vec<Message> {
    vec![
        make_message(1, None),
        make_message(2, Some(1)),
        make_message(5, Some(2)),
        make_message(9, Some(99)),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Example 1: coverage and gap settlement
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_example_one_initial_coverage() {
    let seq = make_sequencer(example_one_stored(), Vec::new());
    let report = seq.archive().refresh(CHANNEL).await.unwrap();

    assert_eq!(report.min_id, Some(MessageId::new(1)));
    assert_eq!(report.max_id, Some(MessageId::new(10)));
    assert_eq!(report.stored_count, 6);
    assert_eq!(report.gaps, vec![range(4, 6), range(9, 9)]);
    assert!(report.confirmed_absent.is_empty());
}

#[tokio::test]
async fn test_example_one_gap_fill_confirms_deleted_id() {
    let seq = make_sequencer(example_one_stored(), example_one_upstream());
    let ctx = ChannelContext::new(CHANNEL);

    let report = seq
        .submit(&ctx, FetchTask::FetchGap { start: MessageId::new(4), end: MessageId::new(6) })
        .await
        .unwrap();

    assert_eq!(report.progress.messages_persisted, 2);
    assert_eq!(report.confirmed_absent, 1);
    // Only the requested range is settled; (9,9) was not part of it
    assert_eq!(report.coverage.gaps, vec![range(9, 9)]);
    assert_eq!(report.coverage.confirmed_absent, ids(&[5]));
    assert_eq!(
        seq.store().get_ids(CHANNEL).await.unwrap(),
        ids(&[1, 2, 3, 4, 6, 7, 8, 10])
    );
}

#[tokio::test]
async fn test_example_one_absent_id_is_not_reported_again() {
    let seq = make_sequencer(example_one_stored(), example_one_upstream());
    let ctx = ChannelContext::new(CHANNEL);

    seq.submit(&ctx, FetchTask::FetchGap { start: MessageId::new(4), end: MessageId::new(6) })
        .await
        .unwrap();
    let report = seq.submit(&ctx, FetchTask::FetchScan).await.unwrap();

    assert!(report.coverage.is_complete());
    assert_eq!(report.confirmed_absent, 0);
    assert_eq!(report.coverage.confirmed_absent, ids(&[5]));
    assert_eq!(report.coverage.stored_count, 9);

    // A second scan has nothing to do
    let again = seq.submit(&ctx, FetchTask::FetchScan).await.unwrap();
    assert_eq!(again.progress.pages, 0);
    assert_eq!(again.coverage, report.coverage);
}

#[tokio::test]
async fn test_example_one_gap_fill_is_idempotent() {
    let seq = make_sequencer(example_one_stored(), example_one_upstream());
    let ctx = ChannelContext::new(CHANNEL);
    let task = FetchTask::FetchGap { start: MessageId::new(4), end: MessageId::new(6) };

    let first = seq.submit(&ctx, task).await.unwrap();
    let second = seq.submit(&ctx, task).await.unwrap();

    assert_eq!(second.progress.messages_persisted, 0);
    assert_eq!(second.progress.duplicates, 2);
    assert_eq!(second.confirmed_absent, 0);
    assert_eq!(second.coverage, first.coverage);
}

// ─────────────────────────────────────────────────────────────────────────────
// Example 2: reply-chain clustering
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_example_two_initial_topics() {
    let graph = ReplyGraphBuilder::new(CHANNEL).build(&example_two(), &Default::default());

    assert_eq!(graph.len(), 2);
    let first = &graph.topics()[0];
    assert_eq!(first.root_message_id, MessageId::new(1));
    assert_eq!(first.member_ids, ids(&[1, 2, 5]));
    assert_eq!(first.root_kind, RootKind::Origin);
    assert_eq!(first.max_depth(), 2);

    let second = &graph.topics()[1];
    assert_eq!(second.root_message_id, MessageId::new(9));
    assert_eq!(second.member_ids, ids(&[9]));
    assert_eq!(second.root_kind, RootKind::AwaitingParent);
    assert_eq!(second.topic_id, VirtualTopicId::derive(CHANNEL, MessageId::new(9)));
}

#[tokio::test]
async fn test_example_two_parent_fetch_merges_and_retires_id() {
    let mut upstream = example_two();
    upstream.push(make_message(99, None));
    let seq = make_sequencer(example_two(), upstream);
    let ctx = ChannelContext::new(CHANNEL);
    let topics = HybridTopicAggregator::new(Arc::clone(seq.store()));

    let provisional = VirtualTopicId::derive(CHANNEL, MessageId::new(9));
    let report = seq
        .submit(&ctx, FetchTask::FetchByTopic { topic: TopicRef::Virtual(provisional) })
        .await
        .unwrap();
    assert_eq!(report.progress.messages_persisted, 1);
    assert_eq!(report.confirmed_absent, 0);

    let graph = topics.reply_graph(CHANNEL).await.unwrap();
    assert_eq!(graph.len(), 2);
    assert!(graph.get(provisional).is_none());

    let merged = graph.topic_of(MessageId::new(9)).unwrap();
    assert_eq!(merged.root_message_id, MessageId::new(99));
    assert_eq!(merged.member_ids, ids(&[9, 99]));
    assert_eq!(merged.root_kind, RootKind::Origin);
    assert_eq!(merged.topic_id, VirtualTopicId::derive(CHANNEL, MessageId::new(99)));

    // The untouched component keeps its id
    let first = graph.topic_of(MessageId::new(5)).unwrap();
    assert_eq!(first.topic_id, VirtualTopicId::derive(CHANNEL, MessageId::new(1)));
}

#[tokio::test]
async fn test_example_two_deleted_parent_becomes_orphaned() {
    let seq = make_sequencer(example_two(), example_two());
    let ctx = ChannelContext::new(CHANNEL);

    let provisional = VirtualTopicId::derive(CHANNEL, MessageId::new(9));
    let report = seq
        .submit(&ctx, FetchTask::FetchByTopic { topic: TopicRef::Virtual(provisional) })
        .await
        .unwrap();
    assert_eq!(report.confirmed_absent, 1);

    let graph = HybridTopicAggregator::new(Arc::clone(seq.store()))
        .reply_graph(CHANNEL)
        .await
        .unwrap();
    let topic = graph.get(provisional).unwrap();
    assert_eq!(topic.root_kind, RootKind::OrphanedParent);
    assert!(topic.root_kind.is_provisional());
}

#[tokio::test]
async fn test_example_two_hybrid_stats_cover_every_message() {
    let mut stored = example_two();
    stored.push(make_message(12, None).with_native_topic(Some(archive_kernel::NativeTopicId::new(7))));
    let store = Arc::new(InMemoryMessageStore::with_messages(stored));
    let topics = HybridTopicAggregator::new(store);

    let hybrid = topics.stats(CHANNEL, StatsView::Hybrid).await.unwrap();
    let native = topics.stats(CHANNEL, StatsView::Native).await.unwrap();
    let virtual_ = topics.stats(CHANNEL, StatsView::Virtual).await.unwrap();

    let total: usize = hybrid.iter().map(|t| t.message_count).sum();
    assert_eq!(total, 5);
    assert_eq!(hybrid.len(), native.len() + virtual_.len());
    assert!(hybrid[0].is_native);
    assert_eq!(virtual_[0].first_message_id, MessageId::new(1));
    assert_eq!(virtual_[0].message_count, 3);
}
