//! Message storage backends.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use crate::types::{ChannelId, IdRange, Message, MessageId, ReplyEdge};

/// Trait for message storage backends.
///
/// Implementations must guarantee deterministic ordering of results and
/// expose only committed writes to readers. Messages are append-only:
/// writing an id that is already stored keeps the stored version.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync;

    /// Upsert a single message keyed by (channel, id). Returns `true` if the
    /// message was newly inserted.
    async fn put(&self, message: Message) -> Result<bool, Self::Error>;

    /// Commit a page of messages for one channel atomically: either every
    /// message becomes visible or none does. Returns the number newly
    /// inserted; already stored ids are skipped.
    async fn put_batch(&self, channel: ChannelId, messages: Vec<Message>) -> Result<usize, Self::Error>;

    /// All stored ids of a channel, ascending.
    async fn get_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error>;

    /// Stored ids of a channel inside `range`, ascending.
    async fn get_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error>;

    /// Lowest and highest stored id of a channel.
    async fn get_id_bounds(&self, channel: ChannelId) -> Result<Option<(MessageId, MessageId)>, Self::Error>;

    /// Fetch a message by id.
    async fn get(&self, channel: ChannelId, id: MessageId) -> Result<Option<Message>, Self::Error>;

    /// All stored messages of a channel, ordered by id.
    async fn get_messages(&self, channel: ChannelId) -> Result<Vec<Message>, Self::Error>;

    /// Reply edges of a channel (ordered by replying id).
    async fn get_reply_edges(&self, channel: ChannelId) -> Result<Vec<ReplyEdge>, Self::Error>;

    /// Record ids confirmed permanently absent upstream.
    async fn mark_absent(&self, channel: ChannelId, ids: &[MessageId]) -> Result<(), Self::Error>;

    /// Confirmed-absent ids of a channel, ascending.
    async fn get_absent_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error>;

    /// Confirmed-absent ids of a channel inside `range`, ascending.
    async fn get_absent_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error>;

    /// Channels with at least one stored message, ascending.
    async fn list_channels(&self) -> Result<Vec<ChannelId>, Self::Error>;
}

pub use memory::InMemoryMessageStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresMessageStore;
