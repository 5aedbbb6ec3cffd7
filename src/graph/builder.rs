//! Virtual topic reconstruction from reply edges.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::types::{ChannelId, Message, MessageId, RootKind, TopicSummary, VirtualTopic, VirtualTopicId};
use super::UnionFind;

/// Builds the virtual topics of one channel.
///
/// ## Algorithm
///
/// 1. Sort the channel's messages by id; the position in that order is the
///    union-find index
/// 2. For every message whose `reply_to_id` resolves to a stored message,
///    union the two indices (self-replies are ignored)
/// 3. Group indices by representative; each group is one component
/// 4. Root = the member whose reply target is outside the component, lowest
///    id first; a malformed cycle falls back to its lowest id
/// 5. Depth by breadth-first traversal from the root over reply edges in
///    both directions
///
/// Nothing is kept between builds. Running twice on the same messages gives
/// identical output.
#[derive(Debug, Clone, Copy)]
pub struct ReplyGraphBuilder {
    channel_id: ChannelId,
}

impl ReplyGraphBuilder {
    /// Create a builder for a channel.
    pub fn new(channel_id: ChannelId) -> Self {
        Self { channel_id }
    }

    /// Cluster `messages` into virtual topics.
    ///
    /// Messages of other channels are skipped. `absent` holds ids confirmed
    /// deleted upstream and only affects root classification.
    pub fn build(&self, messages: &[Message], absent: &BTreeSet<MessageId>) -> ReplyGraph {
        let mut nodes: Vec<&Message> = messages
            .iter()
            .filter(|m| m.channel_id == self.channel_id)
            .collect();
        nodes.sort_by_key(|m| m.id);
        nodes.dedup_by_key(|m| m.id);

        let index_of = |id: MessageId| nodes.binary_search_by_key(&id, |m| m.id).ok();

        // Resolved parent index per node
        let parents: Vec<Option<usize>> = nodes
            .iter()
            .map(|m| {
                m.reply_to_id
                    .filter(|&target| target != m.id)
                    .and_then(index_of)
            })
            .collect();

        let mut uf = UnionFind::new(nodes.len());
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (child, parent) in parents.iter().enumerate() {
            if let Some(parent) = *parent {
                uf.union(child, parent);
                adjacency[child].push(parent);
                adjacency[parent].push(child);
            }
        }

        // Indices are visited ascending, so each member list is sorted
        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for index in 0..nodes.len() {
            components.entry(uf.find(index)).or_default().push(index);
        }

        let mut topics: Vec<VirtualTopic> = components
            .into_values()
            .map(|members| self.assemble(&nodes, &parents, &adjacency, &members, absent))
            .collect();
        topics.sort_by_key(|t| t.root_message_id);

        let membership = topics
            .iter()
            .enumerate()
            .flat_map(|(slot, topic)| topic.member_ids.iter().map(move |&id| (id, slot)))
            .collect();

        tracing::debug!(
            channel_id = %self.channel_id,
            messages = nodes.len(),
            topics = topics.len(),
            "Clustered reply graph"
        );

        ReplyGraph { channel_id: self.channel_id, topics, membership }
    }

    fn assemble(
        &self,
        nodes: &[&Message],
        parents: &[Option<usize>],
        adjacency: &[Vec<usize>],
        members: &[usize],
        absent: &BTreeSet<MessageId>,
    ) -> VirtualTopic {
        // Members are ascending, so the first candidate has the lowest id
        let root = members
            .iter()
            .copied()
            .find(|&i| parents[i].is_none())
            .unwrap_or(members[0]);

        let root_message = nodes[root];
        // A cycle root still has a resolved parent and counts as an origin
        let unresolved = root_message
            .reply_to_id
            .filter(|&target| target != root_message.id && parents[root].is_none());
        let root_kind = match unresolved {
            None => RootKind::Origin,
            Some(target) if absent.contains(&target) => RootKind::OrphanedParent,
            Some(target) => {
                tracing::debug!(
                    channel_id = %self.channel_id,
                    message_id = %root_message.id,
                    reply_to = %target,
                    "Reply target not stored; provisional root"
                );
                RootKind::AwaitingParent
            }
        };

        let mut depth_map = BTreeMap::new();
        let mut queue = VecDeque::from([(root, 0u32)]);
        depth_map.insert(nodes[root].id, 0);
        while let Some((index, depth)) = queue.pop_front() {
            for &next in &adjacency[index] {
                let id = nodes[next].id;
                if !depth_map.contains_key(&id) {
                    depth_map.insert(id, depth + 1);
                    queue.push_back((next, depth + 1));
                }
            }
        }

        let member_ids: Vec<MessageId> = members.iter().map(|&i| nodes[i].id).collect();
        let first_timestamp = members.iter().map(|&i| nodes[i].timestamp).min().unwrap_or(root_message.timestamp);
        let last_timestamp = members.iter().map(|&i| nodes[i].timestamp).max().unwrap_or(root_message.timestamp);

        VirtualTopic {
            topic_id: VirtualTopicId::derive(self.channel_id, root_message.id),
            channel_id: self.channel_id,
            root_message_id: root_message.id,
            root_kind,
            member_ids,
            depth_map,
            first_timestamp,
            last_timestamp,
        }
    }
}

/// The virtual topics of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyGraph {
    channel_id: ChannelId,
    /// Topics ordered by root id.
    topics: Vec<VirtualTopic>,
    /// Member id to index into `topics`.
    membership: BTreeMap<MessageId, usize>,
}

impl ReplyGraph {
    /// Channel the graph was built for.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Topics ordered by root id.
    pub fn topics(&self) -> &[VirtualTopic] {
        &self.topics
    }

    /// Number of topics.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether the channel has no stored messages.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Look up a topic by id.
    pub fn get(&self, topic_id: VirtualTopicId) -> Option<&VirtualTopic> {
        self.topics.iter().find(|t| t.topic_id == topic_id)
    }

    /// Topic containing a message.
    pub fn topic_of(&self, id: MessageId) -> Option<&VirtualTopic> {
        self.membership.get(&id).map(|&slot| &self.topics[slot])
    }

    /// Listing rows, ordered by root id.
    pub fn summaries(&self) -> Vec<TopicSummary> {
        self.topics.iter().map(VirtualTopic::summary).collect()
    }

    /// Topics whose root is still waiting for a parent.
    pub fn provisional(&self) -> impl Iterator<Item = &VirtualTopic> {
        self.topics.iter().filter(|t| t.root_kind.is_provisional())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const CHAN: ChannelId = ChannelId::new(-1001);

    fn msg(id: i64, reply_to: Option<i64>) -> Message {
        Message::new(CHAN, MessageId::new(id), Some(id % 3), Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(), "m")
            .with_reply_to(reply_to.map(MessageId::new))
    }

    fn member_ids(topic: &VirtualTopic) -> Vec<i64> {
        topic.member_ids.iter().map(|id| id.get()).collect()
    }

    fn build(messages: &[Message]) -> ReplyGraph {
        ReplyGraphBuilder::new(CHAN).build(messages, &BTreeSet::new())
    }

    #[test]
    fn test_reply_chain_and_provisional_root() {
        let graph = build(&[msg(1, None), msg(2, Some(1)), msg(5, Some(2)), msg(9, Some(99))]);

        assert_eq!(graph.len(), 2);
        let first = &graph.topics()[0];
        assert_eq!(first.root_message_id, MessageId::new(1));
        assert_eq!(member_ids(first), vec![1, 2, 5]);
        assert_eq!(first.root_kind, RootKind::Origin);
        assert_eq!(first.depth_map[&MessageId::new(5)], 2);
        assert_eq!(first.max_depth(), 2);

        let second = &graph.topics()[1];
        assert_eq!(second.root_message_id, MessageId::new(9));
        assert_eq!(member_ids(second), vec![9]);
        assert_eq!(second.root_kind, RootKind::AwaitingParent);
        assert_eq!(graph.provisional().count(), 1);
    }

    #[test]
    fn test_parent_arrival_merges_and_retires_old_id() {
        let before = build(&[msg(1, None), msg(9, Some(99))]);
        let stale = before.topic_of(MessageId::new(9)).unwrap().topic_id;

        let after = build(&[msg(1, None), msg(9, Some(99)), msg(99, None)]);
        let merged = after.topic_of(MessageId::new(9)).unwrap();
        assert_eq!(merged.root_message_id, MessageId::new(99));
        assert_eq!(member_ids(merged), vec![9, 99]);
        assert_eq!(merged.root_kind, RootKind::Origin);
        assert_eq!(merged.depth_map[&MessageId::new(9)], 1);
        assert!(after.get(stale).is_none());
        assert_ne!(merged.topic_id, stale);
    }

    #[test]
    fn test_idempotent() {
        let messages = vec![msg(3, Some(1)), msg(1, None), msg(4, Some(3)), msg(7, Some(6)), msg(8, Some(4))];
        let a = build(&messages);
        let mut reversed = messages.clone();
        reversed.reverse();
        let b = build(&reversed);
        assert_eq!(a, b);
    }

    #[test]
    fn test_orphaned_parent_classification() {
        let absent: BTreeSet<_> = [MessageId::new(6)].into_iter().collect();
        let graph = ReplyGraphBuilder::new(CHAN).build(&[msg(7, Some(6)), msg(8, Some(5))], &absent);
        assert_eq!(graph.topics()[0].root_kind, RootKind::OrphanedParent);
        assert_eq!(graph.topics()[1].root_kind, RootKind::AwaitingParent);
    }

    #[test]
    fn test_self_reply_is_ignored() {
        let graph = build(&[msg(4, Some(4))]);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.topics()[0].root_kind, RootKind::Origin);
    }

    #[test]
    fn test_cycle_falls_back_to_lowest_id() {
        let graph = build(&[msg(2, Some(3)), msg(3, Some(2))]);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.topics()[0].root_message_id, MessageId::new(2));
        assert_eq!(graph.topics()[0].depth_map[&MessageId::new(3)], 1);
    }

    #[test]
    fn test_branching_depths_and_timestamps() {
        let graph = build(&[msg(1, None), msg(2, Some(1)), msg(3, Some(1)), msg(4, Some(3))]);
        let topic = &graph.topics()[0];
        assert_eq!(topic.depth_map[&MessageId::new(2)], 1);
        assert_eq!(topic.depth_map[&MessageId::new(3)], 1);
        assert_eq!(topic.depth_map[&MessageId::new(4)], 2);
        assert_eq!(topic.first_timestamp, Utc.timestamp_opt(1_700_000_001, 0).unwrap());
        assert_eq!(topic.last_timestamp, Utc.timestamp_opt(1_700_000_004, 0).unwrap());
    }

    #[test]
    fn test_other_channels_are_skipped() {
        let mut foreign = msg(2, Some(1));
        foreign.channel_id = ChannelId::new(-2002);
        let graph = build(&[msg(1, None), foreign]);
        assert_eq!(graph.len(), 1);
        assert!(graph.topic_of(MessageId::new(2)).is_none());
    }

    #[test]
    fn test_summaries_follow_root_order() {
        let graph = build(&[msg(10, None), msg(3, None), msg(11, Some(10))]);
        let roots: Vec<i64> = graph.summaries().iter().map(|s| s.root_id.get()).collect();
        assert_eq!(roots, vec![3, 10]);
        assert_eq!(graph.summaries()[1].member_count, 2);
    }
}
