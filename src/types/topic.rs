//! Topic identifiers and derived topic views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::canonical::canonical_hash;
use super::message::{ChannelId, MessageId, NativeTopicId};

/// Synthetic identifier of a virtual topic.
///
/// Derived from `(channel, root message)` only, so the same component
/// keeps the same id across reruns and restarts. When a merge changes a
/// component's root, the old id is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualTopicId(u64);

/// Hash input for [`VirtualTopicId::derive`].
#[derive(Serialize)]
struct TopicIdInput<'a> {
    schema_version: &'a str,
    channel_id: i64,
    root_message_id: i64,
}

impl VirtualTopicId {
    /// Derive the topic id for a component rooted at `root`.
    pub fn derive(channel: ChannelId, root: MessageId) -> Self {
        Self(canonical_hash(&TopicIdInput {
            schema_version: crate::ARCHIVE_KERNEL_SCHEMA_VERSION,
            channel_id: channel.get(),
            root_message_id: root.get(),
        }))
    }

    /// Wrap a raw hash value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw hash value.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtualTopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vt-{:016x}", self.0)
    }
}

/// Error parsing a [`VirtualTopicId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid virtual topic id: {0}")]
pub struct TopicIdParseError(pub String);

impl std::str::FromStr for VirtualTopicId {
    type Err = TopicIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let hex = trimmed.strip_prefix("vt-").unwrap_or(trimmed);
        u64::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| TopicIdParseError(trimmed.to_string()))
    }
}

/// A topic as seen by the hybrid view: native when the service
/// supplied one, virtual otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TopicRef {
    /// Forum topic supplied by the chat service.
    Native(NativeTopicId),
    /// Topic reconstructed from reply chains.
    Virtual(VirtualTopicId),
}

impl TopicRef {
    /// Whether this is a native topic.
    pub fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}

impl fmt::Display for TopicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(id) => write!(f, "native:{}", id),
            Self::Virtual(id) => write!(f, "{}", id),
        }
    }
}

/// Why a component's root has no in-component parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootKind {
    /// The root replies to nothing: a genuine conversation start.
    Origin,
    /// The root replies to a message that is not stored yet. Provisional:
    /// the component merges once the parent is fetched.
    AwaitingParent,
    /// The root replies to a message confirmed absent upstream. Provisional
    /// forever.
    OrphanedParent,
}

impl RootKind {
    /// Whether the root is provisional.
    pub fn is_provisional(&self) -> bool {
        !matches!(self, Self::Origin)
    }
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::AwaitingParent => write!(f, "awaiting_parent"),
            Self::OrphanedParent => write!(f, "orphaned_parent"),
        }
    }
}

/// One connected component of a channel's reply graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualTopic {
    /// Stable id derived from the root.
    pub topic_id: VirtualTopicId,
    /// Channel the component belongs to.
    pub channel_id: ChannelId,
    /// Member without an in-component reply target.
    pub root_message_id: MessageId,
    /// Classification of the root.
    pub root_kind: RootKind,
    /// Members, sorted ascending.
    pub member_ids: Vec<MessageId>,
    /// Breadth-first depth of each member from the root.
    pub depth_map: BTreeMap<MessageId, u32>,
    /// Earliest member timestamp.
    pub first_timestamp: DateTime<Utc>,
    /// Latest member timestamp.
    pub last_timestamp: DateTime<Utc>,
}

impl VirtualTopic {
    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.member_ids.len()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: MessageId) -> bool {
        self.member_ids.binary_search(&id).is_ok()
    }

    /// Deepest reply level in the component.
    pub fn max_depth(&self) -> u32 {
        self.depth_map.values().copied().max().unwrap_or(0)
    }

    /// Compact summary for listings.
    pub fn summary(&self) -> TopicSummary {
        TopicSummary {
            topic_id: self.topic_id,
            root_id: self.root_message_id,
            root_kind: self.root_kind,
            member_count: self.member_count(),
            first_timestamp: self.first_timestamp,
            last_timestamp: self.last_timestamp,
        }
    }
}

/// Listing row for a virtual topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    /// Topic id.
    pub topic_id: VirtualTopicId,
    /// Root message.
    pub root_id: MessageId,
    /// Root classification.
    pub root_kind: RootKind,
    /// Number of members.
    pub member_count: usize,
    /// Earliest member timestamp.
    pub first_timestamp: DateTime<Utc>,
    /// Latest member timestamp.
    pub last_timestamp: DateTime<Utc>,
}
