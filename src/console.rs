//! Interactive command surface.
//!
//! Each input line is parsed as one command (clap multicall, so the first
//! word is the command name). Fetch commands are spawned and run in the
//! background; `status` and `stop` stay responsive while they run.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;

use crate::archive::{ArchiveError, ArchiveState, CoverageReport};
use crate::client::{ChannelInfo, ChatClient, ClientError};
use crate::context::ChannelContext;
use crate::hybrid::{HybridTopicAggregator, NativeTopicListing, StatsView, TopicStats};
use crate::sequencer::{FetchActivity, FetchError, FetchReport, FetchSequencer, FetchTask, SequencerState};
use crate::store::MessageStore;
use crate::types::{ChannelId, MessageId, NativeTopicId, TopicRef, TopicSummary, VirtualTopicId};

#[derive(Debug, Parser)]
#[command(multicall = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

/// One console command.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
#[command(rename_all = "snake_case")]
pub enum ConsoleCommand {
    /// Fetch messages newer than the newest stored one
    #[command(visible_alias = "fn")]
    FetchNew,
    /// Fetch messages older than the oldest stored one
    #[command(visible_alias = "fo")]
    FetchOld,
    /// Fill every gap in stored coverage
    #[command(visible_alias = "fs")]
    FetchScan,
    /// Fill one inclusive id range
    #[command(visible_alias = "fg")]
    FetchGap {
        /// First id
        start: i64,
        /// Last id
        end: i64,
    },
    /// List channels visible to the client
    #[command(visible_alias = "lc")]
    ListChan,
    /// Show coverage and fetch state of the current channel
    #[command(visible_alias = "st")]
    Status,
    /// List native topics in stored messages
    ListNativeTopics,
    /// Fetch all messages of a native topic
    FetchByNativeTopic {
        /// Native topic id
        id: i64,
    },
    /// Per-topic stats of native topics
    NativeTopicStats,
    /// List virtual topics rebuilt from reply chains
    ListVirtualTopics,
    /// Fetch missing reply parents of a virtual topic
    FetchByVirtualTopic {
        /// Virtual topic id (vt-...)
        id: VirtualTopicId,
    },
    /// Per-topic stats of virtual topics
    VirtualTopicStats,
    /// Per-topic stats of the hybrid view
    HybridTopicStats,
    /// Stop the running fetch after its current page
    Stop,
    /// Select the channel to operate on
    UseChan {
        /// Channel id
        #[arg(allow_negative_numbers = true)]
        id: i64,
    },
    /// Leave the console
    #[command(visible_aliases = ["q", "quit"])]
    Exit,
}

impl ConsoleCommand {
    /// Parse one input line.
    ///
    /// `Ok(None)` for a blank line. Help requests come back as
    /// [`ConsoleError::Help`] carrying the rendered text.
    pub fn parse_line(line: &str) -> Result<Option<Self>, ConsoleError> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            return Ok(None);
        }
        match ConsoleLine::try_parse_from(words) {
            Ok(parsed) => Ok(Some(parsed.command)),
            Err(e) => match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    Err(ConsoleError::Help(e.render().to_string()))
                }
                _ => Err(ConsoleError::Usage(e.render().to_string())),
            },
        }
    }
}

/// Error type for console commands.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    /// The line is not a valid command.
    #[error("{0}")]
    Usage(String),
    /// Help text was requested.
    #[error("{0}")]
    Help(String),
    /// The command needs a channel.
    #[error("No channel selected, run `use_chan <id>` first")]
    NoChannel,
    /// The console already drives a fetch.
    #[error("{task} is still running on channel {channel}, `stop` it first")]
    JobRunning {
        /// Channel of the running job.
        channel: ChannelId,
        /// Running task.
        task: FetchTask,
    },
    /// Fetch admission failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A query failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    /// The chat client failed.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Output of a console command.
#[derive(Debug)]
pub enum ConsoleReply {
    /// A fetch was admitted and is running.
    Started {
        /// Channel fetched.
        channel: ChannelId,
        /// Task started.
        task: FetchTask,
    },
    /// A background fetch ended.
    FetchEnded {
        /// Channel fetched.
        channel: ChannelId,
        /// Task that ended.
        task: FetchTask,
        /// Report or error.
        outcome: Result<FetchReport, FetchError>,
    },
    /// A background fetch panicked or was aborted.
    FetchAborted {
        /// Channel fetched.
        channel: ChannelId,
        /// Task that ended.
        task: FetchTask,
        /// Join error text.
        reason: String,
    },
    /// Visible channels.
    Channels(Vec<ChannelInfo>),
    /// Coverage and sequencer state.
    Status {
        /// Coverage.
        coverage: CoverageReport,
        /// Sequencer state.
        state: SequencerState,
        /// Task holding the channel.
        activity: Option<FetchActivity>,
    },
    /// Native topic listing.
    NativeTopics(Vec<NativeTopicListing>),
    /// Virtual topic listing.
    VirtualTopics(Vec<TopicSummary>),
    /// Topic statistics.
    Stats {
        /// View requested.
        view: StatsView,
        /// Rows.
        stats: Vec<TopicStats>,
    },
    /// Stop requested.
    Stopping {
        /// Channel stopped.
        channel: ChannelId,
    },
    /// `stop` with nothing running.
    NothingRunning,
    /// Channel switched.
    ChannelSelected(ChannelId),
    /// Leave the console.
    Exit,
}

impl fmt::Display for ConsoleReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { channel, task } => write!(f, "Started {} on {}", task, channel),
            Self::FetchEnded { channel, task, outcome } => match outcome {
                Ok(report) => write!(
                    f,
                    "{} on {} done: {} pages, {} new, {} duplicates, {} confirmed absent, {} gaps left",
                    task,
                    channel,
                    report.progress.pages,
                    report.progress.messages_persisted,
                    report.progress.duplicates,
                    report.confirmed_absent,
                    report.coverage.gaps.len()
                ),
                Err(FetchError::Cancelled { progress }) => write!(
                    f,
                    "{} on {} stopped after {} pages ({} new)",
                    task, channel, progress.pages, progress.messages_persisted
                ),
                Err(e) => write!(f, "{} on {} failed: {}", task, channel, e),
            },
            Self::FetchAborted { channel, task, reason } => {
                write!(f, "{} on {} aborted: {}", task, channel, reason)
            }
            Self::Channels(channels) => {
                if channels.is_empty() {
                    return write!(f, "No channels");
                }
                for (i, channel) in channels.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{:>16}  {:<10}  {}", channel.id, channel.kind, channel.title)?;
                }
                Ok(())
            }
            Self::Status { coverage, state, activity } => {
                writeln!(f, "channel:   {}", coverage.channel_id)?;
                match (coverage.min_id, coverage.max_id) {
                    (Some(min), Some(max)) => writeln!(f, "range:     {}..={} ({} stored)", min, max, coverage.stored_count)?,
                    _ => writeln!(f, "range:     empty")?,
                }
                let gaps: Vec<String> = coverage.gaps.iter().map(ToString::to_string).collect();
                writeln!(f, "gaps:      {} ({} ids) [{}]", coverage.gaps.len(), coverage.missing_count(), gaps.join(", "))?;
                let absent: Vec<String> = coverage.absent_ranges().iter().map(ToString::to_string).collect();
                writeln!(f, "absent:    {} [{}]", coverage.confirmed_absent.len(), absent.join(", "))?;
                match activity {
                    Some(activity) => write!(f, "fetch:     {} ({}, since {})", activity.task, state, activity.started_at),
                    None => write!(f, "fetch:     {}", state),
                }
            }
            Self::NativeTopics(topics) => {
                if topics.is_empty() {
                    return write!(f, "No native topics");
                }
                for (i, topic) in topics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{:>10}  {:>6} msgs  last {}", topic.topic_id, topic.message_count, topic.last_timestamp)?;
                }
                Ok(())
            }
            Self::VirtualTopics(topics) => {
                if topics.is_empty() {
                    return write!(f, "No virtual topics");
                }
                for (i, topic) in topics.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(
                        f,
                        "{}  root {:>8}  {:>5} msgs  {:<15}  {} .. {}",
                        topic.topic_id,
                        topic.root_id,
                        topic.member_count,
                        topic.root_kind,
                        topic.first_timestamp,
                        topic.last_timestamp
                    )?;
                }
                Ok(())
            }
            Self::Stats { view, stats } => {
                let total: usize = stats.iter().map(|s| s.message_count).sum();
                write!(f, "{} view: {} topics, {} messages", view, stats.len(), total)?;
                for row in stats {
                    write!(
                        f,
                        "\n{:<22}  {:>6} msgs  {:>4} authors  {:>8}s",
                        row.topic.to_string(),
                        row.message_count,
                        row.distinct_author_count,
                        row.time_span_secs
                    )?;
                }
                Ok(())
            }
            Self::Stopping { channel } => write!(f, "Stopping fetch on {} after the current page", channel),
            Self::NothingRunning => write!(f, "Nothing running"),
            Self::ChannelSelected(channel) => write!(f, "Using channel {}", channel),
            Self::Exit => write!(f, "Bye"),
        }
    }
}

struct Job {
    channel: ChannelId,
    task: FetchTask,
    handle: JoinHandle<Result<FetchReport, FetchError>>,
}

/// Console state: the selected channel and at most one background fetch.
pub struct Console<S: MessageStore + 'static, C: ChatClient + 'static> {
    sequencer: FetchSequencer<S, C>,
    topics: HybridTopicAggregator<S>,
    archive: ArchiveState<S>,
    /// Limits applied to whichever channel is selected.
    limits: ChannelContext,
    channel: Option<ChannelId>,
    job: Option<Job>,
    /// Outcomes of jobs reaped by `start`, not yet handed out.
    ended: VecDeque<ConsoleReply>,
}

impl<S: MessageStore + 'static, C: ChatClient + 'static> Console<S, C> {
    /// Create a console. `limits` supplies batch size, retry policy and
    /// timeout; its channel is selected when `select_channel` is true.
    pub fn new(sequencer: FetchSequencer<S, C>, limits: ChannelContext, select_channel: bool) -> Self {
        let store = Arc::clone(sequencer.store());
        Self {
            topics: HybridTopicAggregator::new(Arc::clone(&store)),
            archive: ArchiveState::new(store),
            sequencer,
            limits,
            channel: select_channel.then_some(limits.channel_id),
            job: None,
            ended: VecDeque::new(),
        }
    }

    /// Currently selected channel.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    /// Whether a background fetch is attached.
    pub fn has_job(&self) -> bool {
        self.job.is_some()
    }

    fn context(&self) -> Result<ChannelContext, ConsoleError> {
        self.channel
            .map(|channel| self.limits.for_channel(channel))
            .ok_or(ConsoleError::NoChannel)
    }

    /// Parse and run one input line. Blank lines yield `Ok(None)`.
    pub async fn execute_line(&mut self, line: &str) -> Result<Option<ConsoleReply>, ConsoleError> {
        match ConsoleCommand::parse_line(line)? {
            Some(command) => self.execute(command).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run one command.
    pub async fn execute(&mut self, command: ConsoleCommand) -> Result<ConsoleReply, ConsoleError> {
        tracing::debug!(command = ?command, channel = ?self.channel, "Console command");
        match command {
            ConsoleCommand::FetchNew => self.start(FetchTask::FetchNew).await,
            ConsoleCommand::FetchOld => self.start(FetchTask::FetchOld).await,
            ConsoleCommand::FetchScan => self.start(FetchTask::FetchScan).await,
            ConsoleCommand::FetchGap { start, end } => self.start(FetchTask::FetchGap {
                start: MessageId::new(start),
                end: MessageId::new(end),
            }).await,
            ConsoleCommand::FetchByNativeTopic { id } => self.start(FetchTask::FetchByTopic {
                topic: TopicRef::Native(NativeTopicId::new(id)),
            }).await,
            ConsoleCommand::FetchByVirtualTopic { id } => self.start(FetchTask::FetchByTopic {
                topic: TopicRef::Virtual(id),
            }).await,
            ConsoleCommand::ListChan => {
                let channels = self.sequencer.client().list_channels().await?;
                Ok(ConsoleReply::Channels(channels))
            }
            ConsoleCommand::Status => {
                let ctx = self.context()?;
                let coverage = self.archive.refresh(ctx.channel_id).await?;
                Ok(ConsoleReply::Status {
                    coverage,
                    state: self.sequencer.state(ctx.channel_id),
                    activity: self.sequencer.activity(ctx.channel_id),
                })
            }
            ConsoleCommand::ListNativeTopics => {
                let ctx = self.context()?;
                Ok(ConsoleReply::NativeTopics(self.topics.list_native_topics(ctx.channel_id).await?))
            }
            ConsoleCommand::ListVirtualTopics => {
                let ctx = self.context()?;
                let graph = self.topics.reply_graph(ctx.channel_id).await?;
                Ok(ConsoleReply::VirtualTopics(graph.summaries()))
            }
            ConsoleCommand::NativeTopicStats => self.stats(StatsView::Native).await,
            ConsoleCommand::VirtualTopicStats => self.stats(StatsView::Virtual).await,
            ConsoleCommand::HybridTopicStats => self.stats(StatsView::Hybrid).await,
            ConsoleCommand::Stop => Ok(self.stop()),
            ConsoleCommand::UseChan { id } => {
                let channel = ChannelId::new(id);
                self.channel = Some(channel);
                tracing::info!(channel_id = %channel, "Selected channel");
                Ok(ConsoleReply::ChannelSelected(channel))
            }
            ConsoleCommand::Exit => Ok(ConsoleReply::Exit),
        }
    }

    async fn stats(&self, view: StatsView) -> Result<ConsoleReply, ConsoleError> {
        let ctx = self.context()?;
        let stats = self.topics.stats(ctx.channel_id, view).await?;
        Ok(ConsoleReply::Stats { view, stats })
    }

    async fn start(&mut self, task: FetchTask) -> Result<ConsoleReply, ConsoleError> {
        let ctx = self.context()?;
        if self.job.as_ref().is_some_and(|job| job.handle.is_finished()) {
            let reply = self.reap().await;
            self.ended.push_back(reply);
        }
        if let Some(job) = &self.job {
            if job.channel == ctx.channel_id {
                return Err(FetchError::Busy { channel: job.channel, running: job.task }.into());
            }
            return Err(ConsoleError::JobRunning { channel: job.channel, task: job.task });
        }
        let lease = self.sequencer.claim(&ctx, task)?;
        let handle = tokio::spawn(lease.run());
        self.job = Some(Job { channel: ctx.channel_id, task, handle });
        Ok(ConsoleReply::Started { channel: ctx.channel_id, task })
    }

    fn stop(&mut self) -> ConsoleReply {
        let Some(job) = &self.job else {
            return ConsoleReply::NothingRunning;
        };
        if self.sequencer.cancel(job.channel) {
            ConsoleReply::Stopping { channel: job.channel }
        } else {
            ConsoleReply::NothingRunning
        }
    }

    /// Wait for the background fetch to end. Outcomes already collected
    /// are returned first. Pending forever when no job is attached, so it
    /// can sit in a `select!` next to input.
    pub async fn job_finished(&mut self) -> ConsoleReply {
        if let Some(reply) = self.ended.pop_front() {
            return reply;
        }
        if self.job.is_none() {
            return std::future::pending().await;
        }
        self.reap().await
    }

    /// Join the attached job. It stays attached until its handle resolves.
    async fn reap(&mut self) -> ConsoleReply {
        let Some(job) = self.job.as_mut() else {
            return ConsoleReply::NothingRunning;
        };
        let joined = (&mut job.handle).await;
        let (channel, task) = (job.channel, job.task);
        self.job = None;
        match joined {
            Ok(outcome) => ConsoleReply::FetchEnded { channel, task, outcome },
            Err(e) => {
                tracing::error!(channel_id = %channel, task = %task, error = %e, "Fetch task aborted");
                ConsoleReply::FetchAborted { channel, task, reason: e.to_string() }
            }
        }
    }

    /// Stop any running fetch, wait for it to release its channel and
    /// return every outcome not yet handed out.
    pub async fn shutdown(&mut self) -> Vec<ConsoleReply> {
        if let Some(job) = &self.job {
            self.sequencer.cancel(job.channel);
            let reply = self.reap().await;
            self.ended.push_back(reply);
        }
        self.ended.drain(..).collect()
    }
}
