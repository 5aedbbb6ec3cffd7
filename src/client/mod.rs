//! Chat service client seam.
//!
//! The network client is an external collaborator. The kernel only needs
//! a restartable, page-at-a-time view of a channel's history, lookups by
//! id, and the list of visible channels.

pub mod memory;

use std::fmt;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{ChannelId, Message, MessageId, NativeTopicId};

/// Paging direction through a channel's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Ids greater than the boundary, ascending.
    Forward,
    /// Ids lower than the boundary, descending.
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// One page request.
///
/// The boundary is exclusive. A backward request without a boundary
/// starts at the newest message; a forward request without a boundary
/// starts at the oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Paging direction.
    pub direction: Direction,
    /// Exclusive id boundary.
    pub boundary: Option<MessageId>,
    /// Maximum messages in the page.
    pub limit: usize,
    /// Restrict to one native topic.
    pub topic: Option<NativeTopicId>,
}

impl HistoryRequest {
    /// Page of ids above `boundary`.
    pub fn forward(boundary: Option<MessageId>, limit: usize) -> Self {
        Self { direction: Direction::Forward, boundary, limit, topic: None }
    }

    /// Page of ids below `boundary`.
    pub fn backward(boundary: Option<MessageId>, limit: usize) -> Self {
        Self { direction: Direction::Backward, boundary, limit, topic: None }
    }

    /// Restrict the request to a native topic.
    pub fn in_topic(mut self, topic: NativeTopicId) -> Self {
        self.topic = Some(topic);
        self
    }
}

/// A channel visible to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id.
    pub id: ChannelId,
    /// Display title.
    pub title: String,
    /// Service-side kind (`channel`, `supergroup`, `forum`).
    pub kind: String,
}

/// Errors reported by a chat client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The service asked us to slow down.
    #[error("Rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited {
        /// Minimum wait requested by the service.
        retry_after: Duration,
    },
    /// The connection dropped.
    #[error("Disconnected: {0}")]
    Disconnected(String),
    /// The request did not complete in time.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The service refused the request; retrying will not help.
    #[error("Request rejected: {0}")]
    Rejected(String),
    /// A backward page came back without moving below its boundary.
    #[error("Page did not advance below {boundary}")]
    Stalled {
        /// Exclusive upper bound of the request.
        boundary: MessageId,
    },
}

impl ClientError {
    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Stalled { .. })
    }

    /// Wait requested by the service, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Trait for chat service clients.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Fetch one page of a channel's history.
    ///
    /// Pages are independent: the same request may be repeated after a
    /// failure without skipping or duplicating messages.
    async fn fetch_page(&self, channel: ChannelId, request: HistoryRequest) -> Result<Vec<Message>, ClientError>;

    /// Fetch specific messages by id. Ids the service does not know are
    /// silently omitted.
    async fn fetch_messages(&self, channel: ChannelId, ids: &[MessageId]) -> Result<Vec<Message>, ClientError>;

    /// Channels and supergroups visible to the client.
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, ClientError>;
}

pub use memory::{InMemoryChatClient, ImportError};
