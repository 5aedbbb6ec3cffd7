//! In-memory message store for testing and local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::{ChannelId, IdRange, Message, MessageId, ReplyEdge};
use super::MessageStore;

/// Error type for in-memory store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InMemoryError {
    /// The store was switched offline.
    #[error("Store unavailable")]
    Unavailable,
    /// A message in a batch belongs to another channel.
    #[error("Message {id} belongs to channel {actual}, not {expected}")]
    ChannelMismatch {
        /// Message id.
        id: MessageId,
        /// Channel the batch was committed for.
        expected: ChannelId,
        /// Channel carried by the message.
        actual: ChannelId,
    },
}

#[derive(Debug, Default)]
struct ChannelData {
    /// Messages by id.
    messages: BTreeMap<MessageId, Message>,
    /// Ids confirmed absent upstream.
    absent: BTreeSet<MessageId>,
}

/// In-memory message store.
///
/// Uses BTreeMap/BTreeSet for deterministic iteration order. A whole
/// batch is applied under one write lock, so readers never observe a
/// partial page.
#[derive(Debug)]
pub struct InMemoryMessageStore {
    channels: RwLock<BTreeMap<ChannelId, ChannelData>>,
    available: AtomicBool,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryMessageStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-loaded with messages.
    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let store = Self::new();
        {
            let mut channels = store.channels.write();
            for message in messages {
                channels
                    .entry(message.channel_id)
                    .or_default()
                    .messages
                    .entry(message.id)
                    .or_insert(message);
            }
        }
        store
    }

    /// Simulate the store becoming reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored messages in a channel.
    pub fn num_messages(&self, channel: ChannelId) -> usize {
        self.channels
            .read()
            .get(&channel)
            .map(|data| data.messages.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), InMemoryError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InMemoryError::Unavailable)
        }
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    type Error = InMemoryError;

    async fn put(&self, message: Message) -> Result<bool, Self::Error> {
        self.check_available()?;
        let mut channels = self.channels.write();
        let data = channels.entry(message.channel_id).or_default();
        if data.messages.contains_key(&message.id) {
            return Ok(false);
        }
        data.messages.insert(message.id, message);
        Ok(true)
    }

    async fn put_batch(&self, channel: ChannelId, messages: Vec<Message>) -> Result<usize, Self::Error> {
        self.check_available()?;
        // Validate before touching state so a bad batch leaves nothing behind
        if let Some(bad) = messages.iter().find(|m| m.channel_id != channel) {
            return Err(InMemoryError::ChannelMismatch {
                id: bad.id,
                expected: channel,
                actual: bad.channel_id,
            });
        }

        let mut channels = self.channels.write();
        let data = channels.entry(channel).or_default();
        let mut inserted = 0;
        for message in messages {
            if let std::collections::btree_map::Entry::Vacant(slot) = data.messages.entry(message.id) {
                slot.insert(message);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| data.messages.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn get_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| data.messages.range(range.start..=range.end).map(|(id, _)| *id).collect())
            .unwrap_or_default())
    }

    async fn get_id_bounds(&self, channel: ChannelId) -> Result<Option<(MessageId, MessageId)>, Self::Error> {
        self.check_available()?;
        let channels = self.channels.read();
        let Some(data) = channels.get(&channel) else {
            return Ok(None);
        };
        Ok(data
            .messages
            .first_key_value()
            .zip(data.messages.last_key_value())
            .map(|((min, _), (max, _))| (*min, *max)))
    }

    async fn get(&self, channel: ChannelId, id: MessageId) -> Result<Option<Message>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .and_then(|data| data.messages.get(&id).cloned()))
    }

    async fn get_messages(&self, channel: ChannelId) -> Result<Vec<Message>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| data.messages.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_reply_edges(&self, channel: ChannelId) -> Result<Vec<ReplyEdge>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| {
                data.messages
                    .values()
                    .filter_map(|m| m.reply_to_id.map(|parent| ReplyEdge::new(m.id, parent)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_absent(&self, channel: ChannelId, ids: &[MessageId]) -> Result<(), Self::Error> {
        self.check_available()?;
        let mut channels = self.channels.write();
        let data = channels.entry(channel).or_default();
        for id in ids {
            // A stored message is by definition not absent
            if !data.messages.contains_key(id) {
                data.absent.insert(*id);
            }
        }
        Ok(())
    }

    async fn get_absent_ids(&self, channel: ChannelId) -> Result<Vec<MessageId>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| data.absent.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn get_absent_ids_in_range(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .get(&channel)
            .map(|data| data.absent.range(range.start..=range.end).copied().collect())
            .unwrap_or_default())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelId>, Self::Error> {
        self.check_available()?;
        Ok(self.channels
            .read()
            .iter()
            .filter(|(_, data)| !data.messages.is_empty())
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const CHAN: ChannelId = ChannelId::new(-1001);

    fn make_message(id: i64, reply_to: Option<i64>) -> Message {
        Message::new(
            CHAN,
            MessageId::new(id),
            Some(10),
            Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(),
            format!("message {}", id),
        )
        .with_reply_to(reply_to.map(MessageId::new))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryMessageStore::new();
        assert!(store.put(make_message(1, None)).await.unwrap());

        let retrieved = store.get(CHAN, MessageId::new(1)).await.unwrap();
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().id, MessageId::new(1));
    }

    #[tokio::test]
    async fn test_put_is_append_only() {
        let store = InMemoryMessageStore::new();
        store.put(make_message(1, None)).await.unwrap();

        let mut edited = make_message(1, None);
        edited.text = Some("edited".to_string());
        assert!(!store.put(edited).await.unwrap());

        let stored = store.get(CHAN, MessageId::new(1)).await.unwrap().unwrap();
        assert_eq!(stored.text.as_deref(), Some("message 1"));
    }

    #[tokio::test]
    async fn test_put_batch_counts_new_only() {
        let store = InMemoryMessageStore::with_messages(vec![make_message(2, None)]);
        let inserted = store
            .put_batch(CHAN, vec![make_message(1, None), make_message(2, None), make_message(3, None)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        let ids = store.get_ids(CHAN).await.unwrap();
        assert_eq!(ids, vec![MessageId::new(1), MessageId::new(2), MessageId::new(3)]);
    }

    #[tokio::test]
    async fn test_put_batch_rejects_foreign_channel_atomically() {
        let store = InMemoryMessageStore::new();
        let mut foreign = make_message(2, None);
        foreign.channel_id = ChannelId::new(-2002);

        let result = store.put_batch(CHAN, vec![make_message(1, None), foreign]).await;
        assert!(matches!(result, Err(InMemoryError::ChannelMismatch { .. })));
        assert_eq!(store.num_messages(CHAN), 0);
    }

    #[tokio::test]
    async fn test_reply_edges() {
        let store = InMemoryMessageStore::with_messages(vec![
            make_message(1, None),
            make_message(2, Some(1)),
            make_message(5, Some(2)),
        ]);

        let edges = store.get_reply_edges(CHAN).await.unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0], ReplyEdge::new(MessageId::new(2), MessageId::new(1)));
        assert_eq!(edges[1], ReplyEdge::new(MessageId::new(5), MessageId::new(2)));
    }

    #[tokio::test]
    async fn test_mark_absent_skips_stored_ids() {
        let store = InMemoryMessageStore::with_messages(vec![make_message(4, None)]);
        store
            .mark_absent(CHAN, &[MessageId::new(4), MessageId::new(5)])
            .await
            .unwrap();
        assert_eq!(store.get_absent_ids(CHAN).await.unwrap(), vec![MessageId::new(5)]);
    }

    #[tokio::test]
    async fn test_range_queries() {
        let store = InMemoryMessageStore::with_messages([1, 4, 6, 9].map(|id| make_message(id, None)));
        store.mark_absent(CHAN, &[MessageId::new(5), MessageId::new(8)]).await.unwrap();
        let window = IdRange::new(MessageId::new(4), MessageId::new(7)).unwrap();

        assert_eq!(
            store.get_ids_in_range(CHAN, window).await.unwrap(),
            vec![MessageId::new(4), MessageId::new(6)]
        );
        assert_eq!(store.get_absent_ids_in_range(CHAN, window).await.unwrap(), vec![MessageId::new(5)]);
        assert_eq!(
            store.get_id_bounds(CHAN).await.unwrap(),
            Some((MessageId::new(1), MessageId::new(9)))
        );
        assert_eq!(store.get_id_bounds(ChannelId::new(-7)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryMessageStore::new();
        store.set_available(false);
        assert!(matches!(store.get_ids(CHAN).await, Err(InMemoryError::Unavailable)));
        store.set_available(true);
        assert!(store.get_ids(CHAN).await.unwrap().is_empty());
    }
}
