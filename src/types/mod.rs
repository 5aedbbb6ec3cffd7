//! Core types for the archive kernel.

pub mod message;
pub mod edge;
pub mod range;
pub mod topic;

pub use message::{ChannelId, MessageId, NativeTopicId, MediaKind, Message};
pub use edge::ReplyEdge;
pub use range::{IdRange, merge_ranges};
pub use topic::{VirtualTopicId, TopicIdParseError, TopicRef, RootKind, VirtualTopic, TopicSummary};
