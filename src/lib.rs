//! # archive-kernel
//!
//! Gap-aware archiving of chat channels with reply-chain topic reconstruction.
//!
//! The kernel answers two questions about a channel:
//!
//! > Which message ids do we hold, and which are we still missing?
//!
//! > Which conversation does each stored message belong to?
//!
//! ## Core Contract
//!
//! 1. Coverage (`min`, `max`, gaps) is always recomputed from stored ids,
//!    never hand-maintained
//! 2. At most one fetch runs per channel; cancellation is observed only
//!    between committed pages
//! 3. Virtual topics are recomputed from persisted reply edges with a
//!    union-find and get ids derived from their root
//!
//! ## Architecture
//!
//! ```text
//! Command → FetchSequencer → ChatClient (pages) → MessageStore (put_batch)
//!                                                      ↓
//!               ArchiveState (coverage, gaps)  ←  stored ids
//!               ReplyGraphBuilder → HybridTopicAggregator → stats
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same stored messages → identical virtual topic ids and membership
//! - Topic listings are ordered by root id
//! - Gap reports are ordered by range start

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod canonical;
pub mod store;
pub mod client;
pub mod archive;
pub mod graph;
pub mod hybrid;
pub mod sequencer;
pub mod config;
pub mod context;
pub mod console;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    ChannelId, MessageId, NativeTopicId, MediaKind, Message, ReplyEdge, IdRange,
    VirtualTopicId, TopicRef, RootKind, VirtualTopic, TopicSummary,
};
pub use canonical::canonical_hash;
pub use store::{MessageStore, InMemoryMessageStore};
#[cfg(feature = "postgres")]
pub use store::PostgresMessageStore;
pub use client::{ChatClient, ChannelInfo, ClientError, Direction, HistoryRequest, InMemoryChatClient};
pub use archive::{ArchiveState, ArchiveError, CoverageReport, compute_gaps};
pub use graph::{ReplyGraph, ReplyGraphBuilder, UnionFind};
pub use hybrid::{HybridAttribution, HybridTopicAggregator, StatsView, TopicStats, NativeTopicListing};
pub use sequencer::{
    FetchSequencer, FetchTask, FetchLease, FetchReport, FetchProgress, FetchError,
    SequencerState, RetryPolicy,
};
pub use config::{ArchiveConfig, ConfigError};
pub use context::ChannelContext;
pub use console::{Console, ConsoleCommand, ConsoleError, ConsoleReply};

#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version for all archive kernel types.
/// Increment on changes that alter derived topic ids.
pub const ARCHIVE_KERNEL_SCHEMA_VERSION: &str = "1.0.0";

/// Default number of messages requested per page.
pub const DEFAULT_BATCH_SIZE: usize = 20;
