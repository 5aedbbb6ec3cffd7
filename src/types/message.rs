//! Message types for the archive kernel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;

/// Identifier of a message within one channel.
///
/// Assigned by the chat service. Totally ordered but not contiguous:
/// ids can be permanently missing after upstream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(i64);

impl MessageId {
    /// Create a new MessageId.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(&self) -> i64 {
        self.0
    }

    /// The next id (saturating).
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// The previous id (saturating).
    pub fn prev(&self) -> Self {
        Self(self.0.saturating_sub(1))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for MessageId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Stable external identifier of a channel (chat, supergroup or forum).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(i64);

impl ChannelId {
    /// Create a new ChannelId.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ChannelId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for ChannelId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Thread identifier supplied by the chat service's forum feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeTopicId(i64);

impl NativeTopicId {
    /// Create a new NativeTopicId.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw id.
    pub const fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for NativeTopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NativeTopicId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

/// Kind of media attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Photo.
    Photo,
    /// Video or animation.
    Video,
    /// Generic file.
    Document,
    /// Voice or audio note.
    Audio,
    /// Sticker.
    Sticker,
    /// Poll.
    Poll,
    /// Anything the archive does not model explicitly.
    Other(String),
}

impl MediaKind {
    /// Parse media kind from the service's string form.
    ///
    /// Accepts both bare names (`photo`) and enum-style names
    /// (`MessageMediaType.PHOTO`).
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return None;
        }
        let name = trimmed.rsplit('.').next().unwrap_or(trimmed).to_lowercase();
        Some(match name.as_str() {
            "photo" => Self::Photo,
            "video" | "animation" | "video_note" => Self::Video,
            "document" => Self::Document,
            "audio" | "voice" => Self::Audio,
            "sticker" => Self::Sticker,
            "poll" => Self::Poll,
            _ => Self::Other(name),
        })
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Photo => write!(f, "photo"),
            Self::Video => write!(f, "video"),
            Self::Document => write!(f, "document"),
            Self::Audio => write!(f, "audio"),
            Self::Sticker => write!(f, "sticker"),
            Self::Poll => write!(f, "poll"),
            Self::Other(name) => write!(f, "{}", name),
        }
    }
}

/// An archived message.
///
/// Created when a fetched page is persisted and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Per-channel message id.
    pub id: MessageId,
    /// Channel the message belongs to.
    pub channel_id: ChannelId,
    /// Sender, absent for anonymous channel posts.
    pub author_id: Option<i64>,
    /// Time the message was sent.
    pub timestamp: DateTime<Utc>,
    /// Text body or caption.
    pub text: Option<String>,
    /// Attached media, if any.
    pub media_kind: Option<MediaKind>,
    /// Message this one replies to (same channel, weak reference).
    pub reply_to_id: Option<MessageId>,
    /// Forum topic supplied by the service.
    pub native_topic_id: Option<NativeTopicId>,
}

impl Message {
    /// Create a plain text message with no reply reference.
    pub fn new(
        channel_id: ChannelId,
        id: MessageId,
        author_id: Option<i64>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id,
            channel_id,
            author_id,
            timestamp,
            text: Some(text.into()),
            media_kind: None,
            reply_to_id: None,
            native_topic_id: None,
        }
    }

    /// Set the reply reference.
    pub fn with_reply_to(mut self, reply_to: Option<MessageId>) -> Self {
        self.reply_to_id = reply_to;
        self
    }

    /// Set the native topic.
    pub fn with_native_topic(mut self, topic: Option<NativeTopicId>) -> Self {
        self.native_topic_id = topic;
        self
    }

    /// Set the media kind.
    pub fn with_media(mut self, media: Option<MediaKind>) -> Self {
        self.media_kind = media;
        self
    }

    /// Whether this message carries a reply reference to another message.
    pub fn is_reply(&self) -> bool {
        matches!(self.reply_to_id, Some(parent) if parent != self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_message_id_ordering() {
        assert!(MessageId::new(9) < MessageId::new(10));
        assert_eq!(MessageId::new(9).next(), MessageId::new(10));
        assert_eq!(MessageId::new(i64::MAX).next(), MessageId::new(i64::MAX));
    }

    #[test]
    fn test_media_kind_parse() {
        assert_eq!(MediaKind::parse("MessageMediaType.PHOTO"), Some(MediaKind::Photo));
        assert_eq!(MediaKind::parse("voice"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::parse(""), None);
        assert_eq!(
            MediaKind::parse("MessageMediaType.DICE"),
            Some(MediaKind::Other("dice".to_string()))
        );
    }

    #[test]
    fn test_self_reply_is_not_a_reply() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let msg = Message::new(ChannelId::new(1), MessageId::new(5), None, ts, "hi")
            .with_reply_to(Some(MessageId::new(5)));
        assert!(!msg.is_reply());

        let reply = msg.clone().with_reply_to(Some(MessageId::new(4)));
        assert!(reply.is_reply());
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&MessageId::new(42)).unwrap();
        assert_eq!(json, "42");
        let parsed: ChannelId = "-1001593560584".parse().unwrap();
        assert_eq!(parsed.get(), -1001593560584);
    }
}
