//! Reply edges between archived messages.

use serde::{Deserialize, Serialize};
use super::message::MessageId;

/// A reply reference as persisted: `id` replies to `reply_to`.
///
/// The reference is weak. `reply_to` may name a message that is not
/// stored yet, or never will be.
/// Implements `Ord` for deterministic ordering: (id, reply_to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplyEdge {
    /// The replying message.
    pub id: MessageId,
    /// The message being replied to.
    pub reply_to: MessageId,
}

impl ReplyEdge {
    /// Create a new edge.
    pub fn new(id: MessageId, reply_to: MessageId) -> Self {
        Self { id, reply_to }
    }

    /// Self-references carry no structure.
    pub fn is_self_reference(&self) -> bool {
        self.id == self.reply_to
    }
}
