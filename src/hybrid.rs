//! Hybrid topic attribution and statistics.
//!
//! A message that carries a native (forum) topic id belongs to that topic
//! and nothing else. Every other message falls back to the virtual topic
//! of its reply-graph component. The native and virtual views therefore
//! partition the hybrid view exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::ArchiveError;
use crate::graph::{ReplyGraph, ReplyGraphBuilder};
use crate::store::MessageStore;
use crate::types::{ChannelId, Message, MessageId, NativeTopicId, TopicRef};

/// Which slice of the hybrid view a statistics query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsView {
    /// Native topics only.
    Native,
    /// Virtual topics of messages without a native topic.
    Virtual,
    /// Both.
    #[default]
    Hybrid,
}

impl StatsView {
    fn includes(&self, topic: &TopicRef) -> bool {
        match self {
            Self::Native => topic.is_native(),
            Self::Virtual => !topic.is_native(),
            Self::Hybrid => true,
        }
    }
}

impl fmt::Display for StatsView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Virtual => write!(f, "virtual"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for StatsView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "virtual" => Ok(Self::Virtual),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown stats view: {}", other)),
        }
    }
}

/// Statistics of one hybrid topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Topic described.
    pub topic: TopicRef,
    /// Lowest attributed message id (the root for virtual topics).
    pub first_message_id: MessageId,
    /// Messages attributed to the topic.
    pub message_count: usize,
    /// Distinct known authors.
    pub distinct_author_count: usize,
    /// Earliest attributed message.
    pub first_timestamp: DateTime<Utc>,
    /// Latest attributed message.
    pub last_timestamp: DateTime<Utc>,
    /// Seconds between first and last message.
    pub time_span_secs: i64,
    /// Whether the topic is native.
    pub is_native: bool,
}

/// Native topic listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeTopicListing {
    /// Native topic id.
    pub topic_id: NativeTopicId,
    /// Stored messages in the topic.
    pub message_count: usize,
    /// Latest stored message.
    pub last_timestamp: DateTime<Utc>,
}

/// Every stored message of a channel mapped to exactly one hybrid topic.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridAttribution {
    channel_id: ChannelId,
    assignments: BTreeMap<MessageId, TopicRef>,
}

impl HybridAttribution {
    /// Attribute `messages` using the reply graph built over them.
    ///
    /// Clustering runs over all messages so reply chains that cross a native
    /// topic boundary still connect; attribution then prefers the native id.
    pub fn merge(messages: &[Message], graph: &ReplyGraph) -> Self {
        let assignments = messages
            .iter()
            .filter(|m| m.channel_id == graph.channel_id())
            .filter_map(|m| {
                let topic = match m.native_topic_id {
                    Some(native) => TopicRef::Native(native),
                    None => TopicRef::Virtual(graph.topic_of(m.id)?.topic_id),
                };
                Some((m.id, topic))
            })
            .collect();

        Self { channel_id: graph.channel_id(), assignments }
    }

    /// Channel described.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Topic of a message.
    pub fn topic_of(&self, id: MessageId) -> Option<TopicRef> {
        self.assignments.get(&id).copied()
    }

    /// Number of attributed messages.
    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    /// Whether no message is attributed.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    /// Per-topic statistics for one view.
    ///
    /// Native topics come first (by id), then virtual topics by root id.
    pub fn stats(&self, messages: &[Message], view: StatsView) -> Vec<TopicStats> {
        struct Acc {
            first_id: MessageId,
            count: usize,
            authors: BTreeSet<i64>,
            first: DateTime<Utc>,
            last: DateTime<Utc>,
        }

        let mut by_topic: BTreeMap<TopicRef, Acc> = BTreeMap::new();
        for message in messages {
            let Some(topic) = self.topic_of(message.id) else {
                continue;
            };
            if message.channel_id != self.channel_id || !view.includes(&topic) {
                continue;
            }
            let acc = by_topic.entry(topic).or_insert_with(|| Acc {
                first_id: message.id,
                count: 0,
                authors: BTreeSet::new(),
                first: message.timestamp,
                last: message.timestamp,
            });
            acc.first_id = acc.first_id.min(message.id);
            acc.count += 1;
            acc.authors.extend(message.author_id);
            acc.first = acc.first.min(message.timestamp);
            acc.last = acc.last.max(message.timestamp);
        }

        let mut stats: Vec<TopicStats> = by_topic
            .into_iter()
            .map(|(topic, acc)| TopicStats {
                topic,
                first_message_id: acc.first_id,
                message_count: acc.count,
                distinct_author_count: acc.authors.len(),
                first_timestamp: acc.first,
                last_timestamp: acc.last,
                time_span_secs: (acc.last - acc.first).num_seconds(),
                is_native: topic.is_native(),
            })
            .collect();

        stats.sort_by_key(|s| match s.topic {
            TopicRef::Native(id) => (0, id.get()),
            TopicRef::Virtual(_) => (1, s.first_message_id.get()),
        });
        stats
    }
}

/// Topic queries over a message store.
///
/// Every call reloads the channel and rebuilds the reply graph, so answers
/// always reflect what is committed right now.
pub struct HybridTopicAggregator<S: MessageStore> {
    store: Arc<S>,
}

impl<S: MessageStore> Clone for HybridTopicAggregator<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: MessageStore> HybridTopicAggregator<S> {
    /// Create an aggregator over a store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn load(&self, channel: ChannelId) -> Result<(Vec<Message>, BTreeSet<MessageId>), ArchiveError> {
        let messages = self.store.get_messages(channel).await.map_err(ArchiveError::from_store)?;
        let absent = self
            .store
            .get_absent_ids(channel)
            .await
            .map_err(ArchiveError::from_store)?
            .into_iter()
            .collect();
        Ok((messages, absent))
    }

    /// Rebuild the channel's virtual topics.
    pub async fn reply_graph(&self, channel: ChannelId) -> Result<ReplyGraph, ArchiveError> {
        let (messages, absent) = self.load(channel).await?;
        Ok(ReplyGraphBuilder::new(channel).build(&messages, &absent))
    }

    /// Attribute every stored message to one hybrid topic.
    pub async fn attribution(&self, channel: ChannelId) -> Result<HybridAttribution, ArchiveError> {
        let (messages, absent) = self.load(channel).await?;
        let graph = ReplyGraphBuilder::new(channel).build(&messages, &absent);
        Ok(HybridAttribution::merge(&messages, &graph))
    }

    /// Per-topic statistics of a channel.
    pub async fn stats(&self, channel: ChannelId, view: StatsView) -> Result<Vec<TopicStats>, ArchiveError> {
        let (messages, absent) = self.load(channel).await?;
        let graph = ReplyGraphBuilder::new(channel).build(&messages, &absent);
        let stats = HybridAttribution::merge(&messages, &graph).stats(&messages, view);

        tracing::debug!(
            channel_id = %channel,
            view = %view,
            topics = stats.len(),
            messages = messages.len(),
            "Computed topic stats"
        );
        Ok(stats)
    }

    /// Native topics present in stored messages.
    pub async fn list_native_topics(&self, channel: ChannelId) -> Result<Vec<NativeTopicListing>, ArchiveError> {
        let messages = self.store.get_messages(channel).await.map_err(ArchiveError::from_store)?;
        let mut topics: BTreeMap<NativeTopicId, NativeTopicListing> = BTreeMap::new();
        for message in &messages {
            let Some(topic_id) = message.native_topic_id else {
                continue;
            };
            let row = topics.entry(topic_id).or_insert(NativeTopicListing {
                topic_id,
                message_count: 0,
                last_timestamp: message.timestamp,
            });
            row.message_count += 1;
            row.last_timestamp = row.last_timestamp.max(message.timestamp);
        }
        Ok(topics.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use crate::types::VirtualTopicId;
    use chrono::TimeZone;

    const CHAN: ChannelId = ChannelId::new(-1001);

    fn msg(id: i64, author: i64, reply_to: Option<i64>, native: Option<i64>) -> Message {
        Message::new(CHAN, MessageId::new(id), Some(author), Utc.timestamp_opt(1_700_000_000 + id * 60, 0).unwrap(), "m")
            .with_reply_to(reply_to.map(MessageId::new))
            .with_native_topic(native.map(NativeTopicId::new))
    }

    fn fixture() -> Vec<Message> {
        vec![
            msg(1, 10, None, None),
            msg(2, 11, Some(1), None),
            msg(3, 10, Some(2), Some(7)),
            msg(4, 12, None, Some(7)),
            msg(5, 12, None, None),
            msg(6, 13, Some(5), None),
        ]
    }

    fn aggregator(messages: Vec<Message>) -> HybridTopicAggregator<InMemoryMessageStore> {
        HybridTopicAggregator::new(Arc::new(InMemoryMessageStore::with_messages(messages)))
    }

    #[test]
    fn test_native_takes_precedence() {
        let messages = fixture();
        let graph = ReplyGraphBuilder::new(CHAN).build(&messages, &BTreeSet::new());
        let attribution = HybridAttribution::merge(&messages, &graph);

        assert_eq!(attribution.len(), 6);
        assert_eq!(attribution.topic_of(MessageId::new(3)), Some(TopicRef::Native(NativeTopicId::new(7))));
        assert_eq!(
            attribution.topic_of(MessageId::new(2)),
            Some(TopicRef::Virtual(VirtualTopicId::derive(CHAN, MessageId::new(1))))
        );
    }

    #[tokio::test]
    async fn test_views_partition_hybrid() {
        let agg = aggregator(fixture());
        let native = agg.stats(CHAN, StatsView::Native).await.unwrap();
        let virt = agg.stats(CHAN, StatsView::Virtual).await.unwrap();
        let hybrid = agg.stats(CHAN, StatsView::Hybrid).await.unwrap();

        assert_eq!(native.len(), 1);
        assert_eq!(native[0].message_count, 2);
        assert_eq!(native[0].distinct_author_count, 2);
        assert!(native[0].is_native);

        // Message 3 sits in native topic 7, so the chain rooted at 1 keeps 2
        let counts: Vec<usize> = virt.iter().map(|s| s.message_count).collect();
        assert_eq!(counts, vec![2, 2]);
        assert_eq!(virt[0].first_message_id, MessageId::new(1));

        assert_eq!(hybrid.len(), native.len() + virt.len());
        let total: usize = hybrid.iter().map(|s| s.message_count).sum();
        assert_eq!(total, 6);
        assert!(hybrid[0].is_native);
    }

    #[tokio::test]
    async fn test_fully_native_component_has_no_virtual_entry() {
        let agg = aggregator(vec![msg(1, 1, None, Some(1)), msg(2, 1, Some(1), Some(1))]);
        assert!(agg.stats(CHAN, StatsView::Virtual).await.unwrap().is_empty());
        let hybrid = agg.stats(CHAN, StatsView::Hybrid).await.unwrap();
        assert_eq!(hybrid.len(), 1);
        assert_eq!(hybrid[0].time_span_secs, 60);
    }

    #[tokio::test]
    async fn test_list_native_topics() {
        let agg = aggregator(fixture());
        let topics = agg.list_native_topics(CHAN).await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].topic_id, NativeTopicId::new(7));
        assert_eq!(topics[0].message_count, 2);
    }

    #[tokio::test]
    async fn test_empty_channel() {
        let agg = aggregator(Vec::new());
        assert!(agg.stats(CHAN, StatsView::Hybrid).await.unwrap().is_empty());
        assert!(agg.reply_graph(CHAN).await.unwrap().is_empty());
    }

    #[test]
    fn test_stats_view_parse() {
        assert_eq!("Native".parse::<StatsView>().unwrap(), StatsView::Native);
        assert_eq!("hybrid".parse::<StatsView>().unwrap(), StatsView::Hybrid);
        assert!("both".parse::<StatsView>().is_err());
    }
}
