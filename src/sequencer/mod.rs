//! Single-flight fetch orchestration.
//!
//! At most one fetch task runs per channel. A task is admitted by
//! [`FetchSequencer::claim`], which hands out a [`FetchLease`]; the channel
//! returns to idle when the lease is dropped, however the task ended.
//!
//! ## State machine
//!
//! ```text
//! Idle ──claim──▶ Running ──cancel──▶ Cancelling
//!  ▲                 │                    │
//!  └──── lease dropped (done / failed / cancelled)
//! ```
//!
//! Cancellation is cooperative: the running task checks its token after
//! each committed page and while backing off, never in the middle of a
//! page.

pub mod retry;
mod run;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{ArchiveError, ArchiveState, CoverageReport};
use crate::client::{ChatClient, ClientError};
use crate::context::ChannelContext;
use crate::store::MessageStore;
use crate::types::{ChannelId, MessageId, TopicRef};

pub use retry::RetryPolicy;
use run::FetchRun;

/// A unit of fetch work for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum FetchTask {
    /// Messages newer than the newest stored one.
    FetchNew,
    /// Messages older than the oldest stored one, back to the start.
    FetchOld,
    /// Every gap currently reported, oldest first.
    FetchScan,
    /// One inclusive id range.
    FetchGap {
        /// First id.
        start: MessageId,
        /// Last id (inclusive).
        end: MessageId,
    },
    /// Messages of one topic.
    FetchByTopic {
        /// Native or virtual topic.
        topic: TopicRef,
    },
}

impl fmt::Display for FetchTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchNew => write!(f, "fetch_new"),
            Self::FetchOld => write!(f, "fetch_old"),
            Self::FetchScan => write!(f, "fetch_scan"),
            Self::FetchGap { start, end } => write!(f, "fetch_gap({}-{})", start, end),
            Self::FetchByTopic { topic } => write!(f, "fetch_by_topic({})", topic),
        }
    }
}

/// Per-channel sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    /// No task.
    Idle,
    /// A task is running.
    Running,
    /// A stop was requested; the task ends at the next page boundary.
    Cancelling,
}

impl fmt::Display for SequencerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Cancelling => write!(f, "cancelling"),
        }
    }
}

/// Work committed by a task so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchProgress {
    /// Pages committed.
    pub pages: usize,
    /// Messages newly stored.
    pub messages_persisted: usize,
    /// Messages received that were already stored.
    pub duplicates: usize,
}

/// Outcome of a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReport {
    /// Task that ran.
    pub task: FetchTask,
    /// Committed work.
    #[serde(flatten)]
    pub progress: FetchProgress,
    /// Ids newly confirmed absent.
    pub confirmed_absent: usize,
    /// Coverage after the task.
    pub coverage: CoverageReport,
}

/// Error type for fetch tasks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The message store could not be reached. Never retried.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    /// Stopped on request.
    #[error("Fetch cancelled after {} pages", .progress.pages)]
    Cancelled {
        /// Work committed before the stop.
        progress: FetchProgress,
    },
    /// The client kept failing.
    #[error("Fetch failed after {attempts} attempts: {last_error}")]
    Failed {
        /// Attempts made for the failing request.
        attempts: u32,
        /// Error of the last attempt.
        last_error: ClientError,
        /// Work committed before the failure.
        progress: FetchProgress,
    },
    /// Another task holds the channel.
    #[error("Channel {channel} is busy with {running}")]
    Busy {
        /// Channel requested.
        channel: ChannelId,
        /// Task holding it.
        running: FetchTask,
    },
    /// Gap bounds are inverted.
    #[error("Invalid range: {start} > {end}")]
    InvalidRange {
        /// Requested start.
        start: MessageId,
        /// Requested end.
        end: MessageId,
    },
    /// The requested topic does not exist in stored messages.
    #[error("Topic not found: {0}")]
    TopicNotFound(TopicRef),
}

impl FetchError {
    /// Create a storage error from any store error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::StorageUnavailable(e.to_string())
    }

    /// Committed work carried by the error, if any.
    pub fn progress(&self) -> Option<FetchProgress> {
        match self {
            Self::Cancelled { progress } | Self::Failed { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    /// Whether the task ended because of a stop request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<ArchiveError> for FetchError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::StorageUnavailable(msg) => Self::StorageUnavailable(msg),
        }
    }
}

/// A task currently holding a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchActivity {
    /// Lease id.
    pub run_id: Uuid,
    /// Task running.
    pub task: FetchTask,
    /// Running or cancelling.
    pub state: SequencerState,
    /// When the lease was granted.
    pub started_at: DateTime<Utc>,
}

struct ActiveFetch {
    activity: FetchActivity,
    cancel: CancellationToken,
}

/// Admits and runs fetch tasks, one per channel.
pub struct FetchSequencer<S: MessageStore, C: ChatClient> {
    store: Arc<S>,
    client: Arc<C>,
    /// Active tasks keyed by channel.
    active: Arc<Mutex<HashMap<ChannelId, ActiveFetch>>>,
}

impl<S: MessageStore, C: ChatClient> Clone for FetchSequencer<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            active: Arc::clone(&self.active),
        }
    }
}

impl<S: MessageStore, C: ChatClient> FetchSequencer<S, C> {
    /// Create a sequencer over a store and a client.
    pub fn new(store: Arc<S>, client: Arc<C>) -> Self {
        Self {
            store,
            client,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get the message store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the chat client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Coverage queries over the same store.
    pub fn archive(&self) -> ArchiveState<S> {
        ArchiveState::new(Arc::clone(&self.store))
    }

    /// Reserve the context's channel for `task`.
    ///
    /// Fails with `Busy` while another lease for the channel is alive and
    /// with `InvalidRange` for an inverted gap.
    pub fn claim(&self, ctx: &ChannelContext, task: FetchTask) -> Result<FetchLease<S, C>, FetchError> {
        if let FetchTask::FetchGap { start, end } = task {
            if start > end {
                return Err(FetchError::InvalidRange { start, end });
            }
        }

        let channel = ctx.channel_id;
        let mut active = self.active.lock();
        if let Some(current) = active.get(&channel) {
            tracing::warn!(
                channel_id = %channel,
                requested = %task,
                running = %current.activity.task,
                "Rejected fetch: channel busy"
            );
            return Err(FetchError::Busy { channel, running: current.activity.task });
        }

        let cancel = CancellationToken::new();
        let run_id = Uuid::new_v4();
        active.insert(
            channel,
            ActiveFetch {
                activity: FetchActivity {
                    run_id,
                    task,
                    state: SequencerState::Running,
                    started_at: Utc::now(),
                },
                cancel: cancel.clone(),
            },
        );
        drop(active);

        Ok(FetchLease {
            sequencer: self.clone(),
            ctx: *ctx,
            task,
            run_id,
            cancel,
        })
    }

    /// Claim the channel and run `task` to completion.
    pub async fn submit(&self, ctx: &ChannelContext, task: FetchTask) -> Result<FetchReport, FetchError> {
        self.claim(ctx, task)?.run().await
    }

    /// Ask the channel's running task to stop. Returns `false` when idle.
    pub fn cancel(&self, channel: ChannelId) -> bool {
        let mut active = self.active.lock();
        let Some(current) = active.get_mut(&channel) else {
            return false;
        };
        if current.activity.state == SequencerState::Running {
            tracing::warn!(
                channel_id = %channel,
                task = %current.activity.task,
                run_id = %current.activity.run_id,
                "Stop requested"
            );
            current.activity.state = SequencerState::Cancelling;
        }
        current.cancel.cancel();
        true
    }

    /// Ask every running task to stop. Returns how many were running.
    pub fn cancel_all(&self) -> usize {
        let channels: Vec<ChannelId> = self.active.lock().keys().copied().collect();
        channels.into_iter().filter(|&channel| self.cancel(channel)).count()
    }

    /// Current state of a channel.
    pub fn state(&self, channel: ChannelId) -> SequencerState {
        self.active
            .lock()
            .get(&channel)
            .map(|current| current.activity.state)
            .unwrap_or(SequencerState::Idle)
    }

    /// Task holding a channel, if any.
    pub fn activity(&self, channel: ChannelId) -> Option<FetchActivity> {
        self.active.lock().get(&channel).map(|current| current.activity.clone())
    }

    /// Number of channels with a task.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// Exclusive right to fetch one channel.
///
/// Dropping the lease returns the channel to idle.
pub struct FetchLease<S: MessageStore, C: ChatClient> {
    sequencer: FetchSequencer<S, C>,
    ctx: ChannelContext,
    task: FetchTask,
    run_id: Uuid,
    cancel: CancellationToken,
}

impl<S: MessageStore, C: ChatClient> fmt::Debug for FetchLease<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchLease")
            .field("channel_id", &self.ctx.channel_id)
            .field("task", &self.task)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl<S: MessageStore, C: ChatClient> FetchLease<S, C> {
    /// Task this lease was granted for.
    pub fn task(&self) -> FetchTask {
        self.task
    }

    /// Channel held.
    pub fn channel_id(&self) -> ChannelId {
        self.ctx.channel_id
    }

    /// Lease id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Token tripped by [`FetchSequencer::cancel`].
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the task, consuming the lease.
    pub async fn run(self) -> Result<FetchReport, FetchError> {
        self.execute().await
    }

    /// Run the task while keeping the channel claimed. The channel stays
    /// busy until the lease is dropped, so callers can publish the outcome
    /// before another task is admitted.
    pub async fn execute(&self) -> Result<FetchReport, FetchError> {
        let channel = self.ctx.channel_id;
        tracing::info!(
            channel_id = %channel,
            task = %self.task,
            run_id = %self.run_id,
            batch_size = self.ctx.batch_size,
            "Fetch started"
        );

        let archive = self.sequencer.archive();
        let mut run = FetchRun::new(
            self.sequencer.store.as_ref(),
            self.sequencer.client.as_ref(),
            &archive,
            &self.ctx,
            &self.cancel,
        );

        let outcome = match run.execute(self.task).await {
            Ok(()) => {
                let (progress, confirmed_absent) = run.finish();
                archive.refresh(channel).await.map_err(FetchError::from).map(|coverage| FetchReport {
                    task: self.task,
                    progress,
                    confirmed_absent,
                    coverage,
                })
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(report) => tracing::info!(
                channel_id = %channel,
                task = %self.task,
                pages = report.progress.pages,
                persisted = report.progress.messages_persisted,
                duplicates = report.progress.duplicates,
                confirmed_absent = report.confirmed_absent,
                gaps = report.coverage.gaps.len(),
                "Fetch finished"
            ),
            Err(FetchError::Cancelled { progress }) => tracing::warn!(
                channel_id = %channel,
                task = %self.task,
                pages = progress.pages,
                persisted = progress.messages_persisted,
                "Fetch cancelled"
            ),
            Err(e) => tracing::error!(
                channel_id = %channel,
                task = %self.task,
                error = %e,
                "Fetch failed"
            ),
        }
        outcome
    }
}

impl<S: MessageStore, C: ChatClient> Drop for FetchLease<S, C> {
    fn drop(&mut self) {
        let mut active = self.sequencer.active.lock();
        let owned = active
            .get(&self.ctx.channel_id)
            .is_some_and(|current| current.activity.run_id == self.run_id);
        if owned {
            active.remove(&self.ctx.channel_id);
        }
    }
}
