//! Service state management.
//!
//! Contains the run registry and shared service state.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ChatClient;
use crate::config::ArchiveConfig;
use crate::context::ChannelContext;
use crate::hybrid::HybridTopicAggregator;
use crate::sequencer::{FetchActivity, FetchError, FetchProgress, FetchReport, FetchSequencer, FetchTask};
use crate::store::MessageStore;
use crate::types::ChannelId;

/// How a background fetch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The task ran to completion.
    Completed {
        /// Final report.
        report: FetchReport,
    },
    /// Stopped on request.
    Cancelled {
        /// Work committed before the stop.
        progress: FetchProgress,
    },
    /// Ended with an error.
    Failed {
        /// Error message.
        error: String,
        /// Work committed before the failure, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<FetchProgress>,
    },
}

impl RunOutcome {
    /// Classify the result of [`FetchLease::run`](crate::FetchLease::run).
    pub fn from_result(result: Result<FetchReport, FetchError>) -> Self {
        match result {
            Ok(report) => Self::Completed { report },
            Err(FetchError::Cancelled { progress }) => Self::Cancelled { progress },
            Err(e) => Self::Failed {
                progress: e.progress(),
                error: e.to_string(),
            },
        }
    }
}

/// A finished background fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Lease id.
    pub run_id: Uuid,
    /// Task that ran.
    pub task: FetchTask,
    /// When the lease was granted.
    pub started_at: DateTime<Utc>,
    /// When the task ended.
    pub finished_at: DateTime<Utc>,
    /// How it ended.
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

/// Last finished run per channel.
///
/// The sequencer only knows about running tasks; this keeps the outcome
/// of background fetches around for status queries.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    last: BTreeMap<ChannelId, RunRecord>,
}

impl RunRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished run, replacing the channel's previous record.
    pub fn record(&mut self, channel: ChannelId, activity: &FetchActivity, outcome: RunOutcome) {
        self.last.insert(
            channel,
            RunRecord {
                run_id: activity.run_id,
                task: activity.task,
                started_at: activity.started_at,
                finished_at: Utc::now(),
                outcome,
            },
        );
    }

    /// Last finished run of a channel.
    pub fn last_run(&self, channel: ChannelId) -> Option<&RunRecord> {
        self.last.get(&channel)
    }

    /// Number of channels with a recorded run.
    pub fn len(&self) -> usize {
        self.last.len()
    }

    /// Check if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}

/// Shared service state.
///
/// Contains the fetch sequencer, the topic aggregator over the same
/// store, the configured limits and the run registry.
pub struct ServiceState<S: MessageStore + 'static, C: ChatClient + 'static> {
    /// Single-flight fetch orchestration.
    pub sequencer: FetchSequencer<S, C>,
    /// Topic queries.
    pub topics: HybridTopicAggregator<S>,
    /// Outcomes of finished background fetches.
    pub runs: Arc<RwLock<RunRegistry>>,
    config: Arc<ArchiveConfig>,
}

impl<S: MessageStore + 'static, C: ChatClient + 'static> ServiceState<S, C> {
    /// Create service state over a store and a client.
    pub fn new(store: S, client: C, config: ArchiveConfig) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(client), config)
    }

    /// Create service state over already shared handles.
    pub fn from_shared(store: Arc<S>, client: Arc<C>, config: ArchiveConfig) -> Self {
        Self {
            topics: HybridTopicAggregator::new(Arc::clone(&store)),
            sequencer: FetchSequencer::new(store, client),
            runs: Arc::new(RwLock::new(RunRegistry::new())),
            config: Arc::new(config),
        }
    }

    /// Operation context for a channel using the configured limits.
    pub fn context(&self, channel: ChannelId) -> ChannelContext {
        ChannelContext::from_config(channel, &self.config)
    }

    /// Configuration the service was started with.
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }
}

impl<S: MessageStore + 'static, C: ChatClient + 'static> Clone for ServiceState<S, C> {
    fn clone(&self) -> Self {
        Self {
            sequencer: self.sequencer.clone(),
            topics: self.topics.clone(),
            runs: Arc::clone(&self.runs),
            config: Arc::clone(&self.config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::CoverageReport;
    use crate::client::ClientError;
    use crate::sequencer::SequencerState;
    use std::time::Duration;

    fn activity(task: FetchTask) -> FetchActivity {
        FetchActivity {
            run_id: Uuid::new_v4(),
            task,
            state: SequencerState::Running,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_outcome_classification() {
        let progress = FetchProgress { pages: 2, messages_persisted: 40, duplicates: 0 };

        let cancelled = RunOutcome::from_result(Err(FetchError::Cancelled { progress }));
        assert_eq!(cancelled, RunOutcome::Cancelled { progress });

        let failed = RunOutcome::from_result(Err(FetchError::Failed {
            attempts: 5,
            last_error: ClientError::Timeout(Duration::from_secs(30)),
            progress,
        }));
        match failed {
            RunOutcome::Failed { error, progress: Some(p) } => {
                assert!(error.contains("5 attempts"));
                assert_eq!(p.pages, 2);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let storage = RunOutcome::from_result(Err(FetchError::StorageUnavailable("down".into())));
        assert!(matches!(storage, RunOutcome::Failed { progress: None, .. }));
    }

    #[test]
    fn test_registry_keeps_last_run_per_channel() {
        let channel = ChannelId::new(-100);
        let mut registry = RunRegistry::new();
        assert!(registry.is_empty());

        registry.record(channel, &activity(FetchTask::FetchOld), RunOutcome::Cancelled {
            progress: FetchProgress::default(),
        });
        let second = activity(FetchTask::FetchScan);
        registry.record(channel, &second, RunOutcome::Completed {
            report: FetchReport {
                task: FetchTask::FetchScan,
                progress: FetchProgress::default(),
                confirmed_absent: 0,
                coverage: CoverageReport {
                    channel_id: channel,
                    min_id: None,
                    max_id: None,
                    stored_count: 0,
                    gaps: Vec::new(),
                    confirmed_absent: Vec::new(),
                },
            },
        });

        assert_eq!(registry.len(), 1);
        let last = registry.last_run(channel).unwrap();
        assert_eq!(last.run_id, second.run_id);
        assert_eq!(last.task, FetchTask::FetchScan);
        assert!(last.finished_at >= last.started_at);
    }
}
