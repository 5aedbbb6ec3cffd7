//! Execution of one fetch task.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;

use crate::archive::ArchiveState;
use crate::client::{ChatClient, ClientError, HistoryRequest};
use crate::context::ChannelContext;
use crate::graph::ReplyGraphBuilder;
use crate::store::MessageStore;
use crate::types::{ChannelId, IdRange, Message, MessageId, NativeTopicId, RootKind, TopicRef, VirtualTopicId};
use super::{FetchError, FetchProgress, FetchTask};

#[derive(Debug, Clone, Copy)]
enum ClientCall<'a> {
    Page(HistoryRequest),
    Lookup(&'a [MessageId]),
}

/// State of a task while it runs. Owned by the lease for the task's
/// lifetime.
pub(super) struct FetchRun<'a, S: MessageStore, C: ChatClient> {
    store: &'a S,
    client: &'a C,
    archive: &'a ArchiveState<S>,
    ctx: &'a ChannelContext,
    cancel: &'a CancellationToken,
    progress: FetchProgress,
    confirmed_absent: usize,
}

impl<'a, S: MessageStore, C: ChatClient> FetchRun<'a, S, C> {
    pub(super) fn new(
        store: &'a S,
        client: &'a C,
        archive: &'a ArchiveState<S>,
        ctx: &'a ChannelContext,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            archive,
            ctx,
            cancel,
            progress: FetchProgress::default(),
            confirmed_absent: 0,
        }
    }

    /// Committed progress and newly confirmed-absent count.
    pub(super) fn finish(&self) -> (FetchProgress, usize) {
        (self.progress, self.confirmed_absent)
    }

    fn channel(&self) -> ChannelId {
        self.ctx.channel_id
    }

    fn batch_size(&self) -> usize {
        self.ctx.batch_size.max(1)
    }

    pub(super) async fn execute(&mut self, task: FetchTask) -> Result<(), FetchError> {
        self.check_cancelled()?;
        match task {
            FetchTask::FetchNew => self.fetch_new().await,
            FetchTask::FetchOld => self.fetch_old().await,
            FetchTask::FetchScan => self.fetch_scan().await,
            FetchTask::FetchGap { start, end } => {
                let range = IdRange::new(start, end).ok_or(FetchError::InvalidRange { start, end })?;
                self.fill_gap(range).await
            }
            FetchTask::FetchByTopic { topic: TopicRef::Native(topic) } => self.fetch_native_topic(topic).await,
            FetchTask::FetchByTopic { topic: TopicRef::Virtual(topic) } => self.fetch_virtual_topic(topic).await,
        }
    }

    fn check_cancelled(&self) -> Result<(), FetchError> {
        if self.cancel.is_cancelled() {
            Err(FetchError::Cancelled { progress: self.progress })
        } else {
            Ok(())
        }
    }

    /// Issue one client call with timeout and bounded retry.
    async fn call(&self, call: ClientCall<'_>) -> Result<Vec<Message>, FetchError> {
        let policy = self.ctx.retry;
        let timeout = self.ctx.request_timeout;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let pending = match call {
                ClientCall::Page(request) => self.client.fetch_page(self.channel(), request),
                ClientCall::Lookup(ids) => self.client.fetch_messages(self.channel(), ids),
            };
            let error = match tokio::time::timeout(timeout, pending).await {
                Ok(Ok(messages)) => return Ok(messages),
                Ok(Err(e)) => e,
                Err(_) => ClientError::Timeout(timeout),
            };

            if !error.is_transient() || !policy.should_retry(attempt) {
                return Err(FetchError::Failed {
                    attempts: attempt,
                    last_error: error,
                    progress: self.progress,
                });
            }

            let delay = policy.delay_for(attempt, error.retry_after());
            tracing::warn!(
                channel_id = %self.channel(),
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient client error, backing off"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(FetchError::Cancelled { progress: self.progress });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn page(&self, request: HistoryRequest) -> Result<Vec<Message>, FetchError> {
        self.call(ClientCall::Page(request)).await
    }

    /// Persist one page atomically, then honour a pending stop.
    async fn commit(&mut self, page: Vec<Message>) -> Result<(), FetchError> {
        let channel = self.channel();
        let received = page.len();
        let page: Vec<Message> = page.into_iter().filter(|m| m.channel_id == channel).collect();
        if page.len() != received {
            tracing::warn!(
                channel_id = %channel,
                dropped = received - page.len(),
                "Dropped messages of another channel from page"
            );
        }

        let fetched = page.len();
        let inserted = self
            .store
            .put_batch(channel, page)
            .await
            .map_err(FetchError::from_store)?;

        self.progress.pages += 1;
        self.progress.messages_persisted += inserted;
        self.progress.duplicates += fetched - inserted;

        tracing::debug!(
            channel_id = %channel,
            page = self.progress.pages,
            fetched,
            inserted,
            "Committed page"
        );
        self.check_cancelled()
    }

    async fn fetch_new(&mut self) -> Result<(), FetchError> {
        let Some(mut boundary) = self.archive.next_new_target(self.channel()).await? else {
            // Nothing stored: anchor coverage at the head of the channel
            let page = self.page(HistoryRequest::backward(None, self.batch_size())).await?;
            return self.commit(page).await;
        };

        loop {
            let page = self.page(HistoryRequest::forward(Some(boundary), self.batch_size())).await?;
            let Some(highest) = page.iter().map(|m| m.id).max() else {
                break;
            };
            self.commit(page).await?;
            if highest <= boundary {
                break;
            }
            boundary = highest;
        }
        Ok(())
    }

    async fn fetch_old(&mut self) -> Result<(), FetchError> {
        let mut boundary = self.archive.next_old_target(self.channel()).await?;
        loop {
            let page = self.page(HistoryRequest::backward(boundary, self.batch_size())).await?;
            let Some(lowest) = page.iter().map(|m| m.id).min() else {
                break;
            };
            self.commit(page).await?;
            if boundary.is_some_and(|b| lowest >= b) {
                break;
            }
            boundary = Some(lowest);
        }
        Ok(())
    }

    async fn fetch_scan(&mut self) -> Result<(), FetchError> {
        let report = self.archive.refresh(self.channel()).await?;
        tracing::info!(
            channel_id = %self.channel(),
            gaps = report.gaps.len(),
            missing = report.missing_count(),
            "Scanning gaps"
        );
        for gap in report.gaps {
            self.fill_gap(gap).await?;
        }
        Ok(())
    }

    /// Walk `range` backwards from its end, then settle what is still missing.
    async fn fill_gap(&mut self, range: IdRange) -> Result<(), FetchError> {
        tracing::debug!(channel_id = %self.channel(), range = %range, "Filling gap");
        let mut boundary = range.end.next();
        loop {
            let page = self.page(HistoryRequest::backward(Some(boundary), self.batch_size())).await?;
            let Some(lowest) = page.iter().map(|m| m.id).min() else {
                break;
            };
            let wanted = page.into_iter().filter(|m| range.contains(m.id)).collect();
            self.commit(wanted).await?;
            if lowest <= range.start {
                break;
            }
            if lowest >= boundary {
                // Part of the range was never walked, so nothing may be settled
                return Err(FetchError::Failed {
                    attempts: 1,
                    last_error: ClientError::Stalled { boundary },
                    progress: self.progress,
                });
            }
            boundary = lowest;
        }

        let settled = self.archive.settle_gap(self.channel(), range).await?;
        self.confirmed_absent += settled.len();
        Ok(())
    }

    async fn fetch_native_topic(&mut self, topic: NativeTopicId) -> Result<(), FetchError> {
        let mut boundary: Option<MessageId> = None;
        loop {
            let request = HistoryRequest::backward(boundary, self.batch_size()).in_topic(topic);
            let page = self.page(request).await?;
            let Some(lowest) = page.iter().map(|m| m.id).min() else {
                break;
            };
            self.commit(page).await?;
            if boundary.is_some_and(|b| lowest >= b) {
                break;
            }
            boundary = Some(lowest);
        }
        Ok(())
    }

    /// Climb the reply chain above a virtual topic's root until it reaches
    /// an origin or a parent the service no longer has.
    ///
    /// The topic id is only used to find the starting component: each
    /// fetched parent becomes the new root and retires the old id.
    async fn fetch_virtual_topic(&mut self, topic_id: VirtualTopicId) -> Result<(), FetchError> {
        let channel = self.channel();
        let builder = ReplyGraphBuilder::new(channel);

        let (messages, absent) = self.load().await?;
        let anchor = builder
            .build(&messages, &absent)
            .get(topic_id)
            .map(|topic| topic.root_message_id)
            .ok_or(FetchError::TopicNotFound(TopicRef::Virtual(topic_id)))?;

        let mut requested: BTreeSet<MessageId> = BTreeSet::new();
        loop {
            let (messages, absent) = self.load().await?;
            let graph = builder.build(&messages, &absent);
            let Some(topic) = graph.topic_of(anchor) else {
                break;
            };
            if topic.root_kind != RootKind::AwaitingParent {
                break;
            }
            let parent = messages
                .binary_search_by_key(&topic.root_message_id, |m| m.id)
                .ok()
                .and_then(|i| messages[i].reply_to_id);
            let Some(parent) = parent else {
                break;
            };
            if !requested.insert(parent) {
                break;
            }

            let found = self.call(ClientCall::Lookup(&[parent])).await?;
            let resolved = found.iter().any(|m| m.id == parent);
            self.commit(found).await?;
            if !resolved {
                self.store
                    .mark_absent(channel, &[parent])
                    .await
                    .map_err(FetchError::from_store)?;
                self.confirmed_absent += 1;
                tracing::info!(
                    channel_id = %channel,
                    parent = %parent,
                    "Reply parent missing upstream, confirmed absent"
                );
                break;
            }
        }
        Ok(())
    }

    async fn load(&self) -> Result<(Vec<Message>, BTreeSet<MessageId>), FetchError> {
        let channel = self.channel();
        let messages = self.store.get_messages(channel).await.map_err(FetchError::from_store)?;
        let absent = self
            .store
            .get_absent_ids(channel)
            .await
            .map_err(FetchError::from_store)?
            .into_iter()
            .collect();
        Ok((messages, absent))
    }
}
