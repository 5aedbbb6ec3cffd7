//! In-memory chat client.
//!
//! Serves a fixed upstream history. Used by tests, benches and the demo
//! binaries (seeded from a JSONL export). Supports injected failures,
//! artificial latency and a per-page hook so callers can script
//! rate limits, disconnects and mid-fetch cancellation.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::types::{ChannelId, MediaKind, Message, MessageId, NativeTopicId};
use super::{ChannelInfo, ChatClient, ClientError, Direction, HistoryRequest};

/// Callback invoked with the 1-based page number before a page is returned.
pub type PageHook = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Default)]
struct UpstreamChannel {
    title: String,
    kind: String,
    messages: BTreeMap<MessageId, Message>,
}

/// In-memory chat client over a scripted upstream history.
#[derive(Default)]
pub struct InMemoryChatClient {
    channels: Mutex<BTreeMap<ChannelId, UpstreamChannel>>,
    /// Errors returned, in order, by the next calls.
    failures: Mutex<VecDeque<ClientError>>,
    latency: Mutex<Option<Duration>>,
    page_hook: Mutex<Option<PageHook>>,
    pages_served: AtomicUsize,
    calls: AtomicUsize,
}

impl std::fmt::Debug for InMemoryChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChatClient")
            .field("channels", &self.channels.lock().len())
            .field("pages_served", &self.pages_served())
            .field("calls", &self.calls())
            .finish()
    }
}

impl InMemoryChatClient {
    /// Create a client with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a client serving `messages`.
    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let client = Self::new();
        for message in messages {
            client.publish(message);
        }
        client
    }

    /// Register or rename a channel.
    pub fn add_channel(&self, id: ChannelId, title: impl Into<String>, kind: impl Into<String>) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(id).or_default();
        channel.title = title.into();
        channel.kind = kind.into();
    }

    /// Make a message available upstream.
    pub fn publish(&self, message: Message) {
        let mut channels = self.channels.lock();
        let channel = channels.entry(message.channel_id).or_insert_with(|| UpstreamChannel {
            title: format!("channel {}", message.channel_id),
            kind: "supergroup".to_string(),
            messages: BTreeMap::new(),
        });
        channel.messages.insert(message.id, message);
    }

    /// Remove a message upstream, as a service-side deletion would.
    pub fn delete(&self, channel: ChannelId, id: MessageId) {
        if let Some(upstream) = self.channels.lock().get_mut(&channel) {
            upstream.messages.remove(&id);
        }
    }

    /// Queue an error for the next call.
    pub fn push_failure(&self, error: ClientError) {
        self.failures.lock().push_back(error);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Install a callback run before each page is returned.
    pub fn set_page_hook(&self, hook: Option<PageHook>) {
        *self.page_hook.lock() = hook;
    }

    /// Number of pages successfully served.
    pub fn pages_served(&self) -> usize {
        self.pages_served.load(Ordering::SeqCst)
    }

    /// Number of calls received, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Load a JSONL export into a client.
    ///
    /// Each line is one exported message record. Records without a `chat`
    /// object are assigned to `default_channel`.
    pub fn from_jsonl(path: &Path, default_channel: ChannelId) -> Result<Self, ImportError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ImportError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let client = Self::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ExportRecord = serde_json::from_str(line).map_err(|e| ImportError::Parse {
                line: index + 1,
                source: e,
            })?;
            if let Some(chat) = &record.chat {
                if let Some(title) = &chat.title {
                    client.add_channel(ChannelId::new(chat.id), title.clone(), "supergroup");
                }
            }
            client.publish(record.into_message(default_channel)?);
        }

        tracing::info!(
            path = %path.display(),
            channels = client.channels.lock().len(),
            "Loaded upstream history from export"
        );
        Ok(client)
    }

    /// Apply latency and injected failures shared by every call.
    async fn enter_call(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn finish_page(&self) {
        let page = self.pages_served.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = self.page_hook.lock().clone();
        if let Some(hook) = hook {
            hook(page);
        }
    }
}

#[async_trait]
impl ChatClient for InMemoryChatClient {
    async fn fetch_page(&self, channel: ChannelId, request: HistoryRequest) -> Result<Vec<Message>, ClientError> {
        self.enter_call().await?;

        let page: Vec<Message> = {
            let channels = self.channels.lock();
            let Some(upstream) = channels.get(&channel) else {
                return Err(ClientError::Rejected(format!("unknown channel {}", channel)));
            };
            let in_topic = |m: &&Message| request.topic.map_or(true, |t| m.native_topic_id == Some(t));
            match request.direction {
                Direction::Forward => {
                    let lower = request.boundary.map(|b| b.next());
                    let iter: Box<dyn Iterator<Item = &Message>> = match lower {
                        Some(lower) => Box::new(upstream.messages.range(lower..).map(|(_, m)| m)),
                        None => Box::new(upstream.messages.values()),
                    };
                    iter.filter(in_topic).take(request.limit).cloned().collect()
                }
                Direction::Backward => {
                    let iter: Box<dyn Iterator<Item = &Message>> = match request.boundary {
                        Some(upper) => Box::new(upstream.messages.range(..upper).rev().map(|(_, m)| m)),
                        None => Box::new(upstream.messages.values().rev()),
                    };
                    iter.filter(in_topic).take(request.limit).cloned().collect()
                }
            }
        };

        self.finish_page();
        Ok(page)
    }

    async fn fetch_messages(&self, channel: ChannelId, ids: &[MessageId]) -> Result<Vec<Message>, ClientError> {
        self.enter_call().await?;

        let found: Vec<Message> = {
            let channels = self.channels.lock();
            let Some(upstream) = channels.get(&channel) else {
                return Err(ClientError::Rejected(format!("unknown channel {}", channel)));
            };
            ids.iter()
                .filter_map(|id| upstream.messages.get(id).cloned())
                .collect()
        };

        self.finish_page();
        Ok(found)
    }

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, ClientError> {
        self.enter_call().await?;
        Ok(self.channels
            .lock()
            .iter()
            .map(|(id, upstream)| ChannelInfo {
                id: *id,
                title: upstream.title.clone(),
                kind: upstream.kind.clone(),
            })
            .collect())
    }
}

/// Error loading an export file.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A line is not a valid record.
    #[error("invalid record on line {line}: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// A record carries an unparseable date.
    #[error("invalid date {value:?} for message {id}")]
    Date {
        /// Message id.
        id: i64,
        /// Raw date value.
        value: String,
    },
}

/// One exported message, as written by the message exporter.
#[derive(Debug, Deserialize)]
struct ExportRecord {
    id: i64,
    #[serde(default)]
    from_user: Option<ExportUser>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    chat: Option<ExportChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media: Option<String>,
    #[serde(default)]
    reply_to_message_id: Option<i64>,
    #[serde(default)]
    reply_to_top_message_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportUser {
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ExportChat {
    id: i64,
    #[serde(default)]
    title: Option<String>,
}

impl ExportRecord {
    fn into_message(self, default_channel: ChannelId) -> Result<Message, ImportError> {
        let timestamp = match self.date.as_deref() {
            Some(raw) => parse_export_date(raw).ok_or_else(|| ImportError::Date {
                id: self.id,
                value: raw.to_string(),
            })?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Message {
            id: MessageId::new(self.id),
            channel_id: self.chat.map(|c| ChannelId::new(c.id)).unwrap_or(default_channel),
            author_id: self.from_user.and_then(|u| u.id),
            timestamp,
            text: self.text,
            media_kind: self.media.as_deref().and_then(MediaKind::parse),
            reply_to_id: self.reply_to_message_id.map(MessageId::new),
            native_topic_id: self.reply_to_top_message_id.map(NativeTopicId::new),
        })
    }
}

/// Accepts RFC 3339 and the exporter's naive `%Y-%m-%dT%H:%M:%S` (UTC).
fn parse_export_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    const CHAN: ChannelId = ChannelId::new(-1001);

    fn make_message(id: i64, topic: Option<i64>) -> Message {
        Message::new(CHAN, MessageId::new(id), Some(1), Utc.timestamp_opt(1_700_000_000 + id, 0).unwrap(), "x")
            .with_native_topic(topic.map(NativeTopicId::new))
    }

    fn ids(page: &[Message]) -> Vec<i64> {
        page.iter().map(|m| m.id.get()).collect()
    }

    #[tokio::test]
    async fn test_backward_paging_from_head() {
        let client = InMemoryChatClient::with_messages((1..=10).map(|i| make_message(i, None)));

        let first = client.fetch_page(CHAN, HistoryRequest::backward(None, 3)).await.unwrap();
        assert_eq!(ids(&first), vec![10, 9, 8]);

        let next = client
            .fetch_page(CHAN, HistoryRequest::backward(Some(MessageId::new(8)), 3))
            .await
            .unwrap();
        assert_eq!(ids(&next), vec![7, 6, 5]);
    }

    #[tokio::test]
    async fn test_forward_paging_is_exclusive() {
        let client = InMemoryChatClient::with_messages((1..=5).map(|i| make_message(i, None)));
        let page = client
            .fetch_page(CHAN, HistoryRequest::forward(Some(MessageId::new(3)), 10))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_topic_filter() {
        let client = InMemoryChatClient::with_messages(vec![
            make_message(1, Some(1)),
            make_message(2, None),
            make_message(3, Some(1)),
            make_message(4, Some(2)),
        ]);
        let page = client
            .fetch_page(CHAN, HistoryRequest::backward(None, 10).in_topic(NativeTopicId::new(1)))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec![3, 1]);
    }

    #[tokio::test]
    async fn test_deleted_messages_are_not_served() {
        let client = InMemoryChatClient::with_messages((4..=6).map(|i| make_message(i, None)));
        client.delete(CHAN, MessageId::new(5));
        let found = client
            .fetch_messages(CHAN, &[MessageId::new(4), MessageId::new(5), MessageId::new(6)])
            .await
            .unwrap();
        assert_eq!(ids(&found), vec![4, 6]);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let client = InMemoryChatClient::with_messages(vec![make_message(1, None)]);
        client.push_failure(ClientError::Disconnected("reset".into()));

        let first = client.fetch_page(CHAN, HistoryRequest::backward(None, 10)).await;
        assert_eq!(first, Err(ClientError::Disconnected("reset".into())));
        let second = client.fetch_page(CHAN, HistoryRequest::backward(None, 10)).await;
        assert!(second.is_ok());
        assert_eq!(client.calls(), 2);
        assert_eq!(client.pages_served(), 1);
    }

    #[tokio::test]
    async fn test_page_hook_sees_page_numbers() {
        let client = InMemoryChatClient::with_messages((1..=4).map(|i| make_message(i, None)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.set_page_hook(Some(Arc::new(move |page| sink.lock().push(page))));

        client.fetch_page(CHAN, HistoryRequest::backward(None, 2)).await.unwrap();
        client.fetch_page(CHAN, HistoryRequest::backward(Some(MessageId::new(3)), 2)).await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_from_jsonl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"id": 148650, "from_user": {{"id": 77, "username": "a"}}, "date": "2024-11-02T10:15:00", "chat": {{"id": -1001593560584, "title": "UA-IT"}}, "text": "hello", "media": null, "reply_to_message_id": 148649, "reply_to_top_message_id": 2642}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"id": 148649, "date": "2024-11-02T10:14:00", "text": "root"}}"#).unwrap();

        let client = InMemoryChatClient::from_jsonl(file.path(), ChannelId::new(-1001593560584)).unwrap();
        let channels = client.channels.lock();
        let upstream = channels.get(&ChannelId::new(-1001593560584)).unwrap();
        assert_eq!(upstream.title, "UA-IT");
        assert_eq!(upstream.messages.len(), 2);

        let reply = upstream.messages.get(&MessageId::new(148650)).unwrap();
        assert_eq!(reply.reply_to_id, Some(MessageId::new(148649)));
        assert_eq!(reply.native_topic_id, Some(NativeTopicId::new(2642)));
        assert_eq!(reply.author_id, Some(77));
    }

    #[test]
    fn test_from_jsonl_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": 1}}"#).unwrap();
        writeln!(file, "not json").unwrap();

        let err = InMemoryChatClient::from_jsonl(file.path(), CHAN).unwrap_err();
        assert!(matches!(err, ImportError::Parse { line: 2, .. }));
    }
}
