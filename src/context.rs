//! Explicit per-channel operation context.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ArchiveConfig;
use crate::sequencer::RetryPolicy;
use crate::types::ChannelId;

/// Everything a fetch or query needs to know about its target channel.
///
/// Passed to every operation instead of living in process-wide state, so
/// several channels can be driven from one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelContext {
    /// Channel operated on.
    pub channel_id: ChannelId,
    /// Messages requested per page.
    pub batch_size: usize,
    /// Retry policy for page requests.
    pub retry: RetryPolicy,
    /// Timeout for a single client call.
    pub request_timeout: Duration,
}

impl ChannelContext {
    /// Context with default batch size, retry policy and timeout.
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Context for `channel_id` using configured limits.
    pub fn from_config(channel_id: ChannelId, config: &ArchiveConfig) -> Self {
        Self {
            channel_id,
            batch_size: config.batch_size,
            retry: config.retry_policy(),
            request_timeout: config.request_timeout,
        }
    }

    /// Set the page size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-call timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Same limits, different channel.
    pub fn for_channel(&self, channel_id: ChannelId) -> Self {
        Self { channel_id, ..*self }
    }
}
