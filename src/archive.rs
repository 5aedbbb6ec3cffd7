//! Archive completeness model.
//!
//! Coverage of a channel is derived from its stored ids every time it is
//! asked for. Nothing here is cached: a crash between two pages leaves a
//! store whose next `refresh` describes exactly what was committed.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::MessageStore;
use crate::types::{ChannelId, IdRange, MessageId, merge_ranges};

/// Error type for archive state queries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    /// The message store could not be reached.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl ArchiveError {
    /// Create a storage error from any store error type.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// Coverage of one channel at the moment of the last refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Channel described.
    pub channel_id: ChannelId,
    /// Lowest stored id.
    pub min_id: Option<MessageId>,
    /// Highest stored id.
    pub max_id: Option<MessageId>,
    /// Number of stored messages.
    pub stored_count: usize,
    /// Missing ranges inside `[min_id, max_id]`, ascending.
    pub gaps: Vec<IdRange>,
    /// Ids confirmed absent upstream, ascending.
    pub confirmed_absent: Vec<MessageId>,
}

impl CoverageReport {
    fn empty(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            min_id: None,
            max_id: None,
            stored_count: 0,
            gaps: Vec::new(),
            confirmed_absent: Vec::new(),
        }
    }

    /// Whether nothing is stored for the channel.
    pub fn is_empty(&self) -> bool {
        self.stored_count == 0
    }

    /// Whether every id in `[min_id, max_id]` is stored or confirmed absent.
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Total number of ids still missing.
    pub fn missing_count(&self) -> u64 {
        self.gaps.iter().map(IdRange::len).sum()
    }

    /// Confirmed-absent ids collapsed into ranges, for display.
    pub fn absent_ranges(&self) -> Vec<IdRange> {
        merge_ranges(self.confirmed_absent.iter().copied().map(IdRange::single).collect())
    }
}

/// Compute the gaps between consecutive stored ids.
///
/// `stored` must be sorted ascending. Ids in `absent` are carved out, so a
/// single gap may be reported as several ranges.
pub fn compute_gaps(stored: &[MessageId], absent: &BTreeSet<MessageId>) -> Vec<IdRange> {
    let mut gaps = Vec::new();
    for pair in stored.windows(2) {
        let (lo, hi) = (pair[0], pair[1]);
        if hi.get().abs_diff(lo.get()) <= 1 {
            continue;
        }
        let mut start = lo.next();
        let end = hi.prev();
        for &skip in absent.range(start..=end) {
            if skip > start {
                gaps.push(IdRange { start, end: skip.prev() });
            }
            start = skip.next();
        }
        if start <= end {
            gaps.push(IdRange { start, end });
        }
    }
    gaps
}

/// Per-channel coverage queries over a message store.
pub struct ArchiveState<S: MessageStore> {
    store: Arc<S>,
}

impl<S: MessageStore> Clone for ArchiveState<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store) }
    }
}

impl<S: MessageStore> ArchiveState<S> {
    /// Create archive state over a store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Recompute coverage of a channel from its stored ids.
    pub async fn refresh(&self, channel: ChannelId) -> Result<CoverageReport, ArchiveError> {
        let stored = self.store.get_ids(channel).await.map_err(ArchiveError::from_store)?;
        let absent: BTreeSet<MessageId> = self
            .store
            .get_absent_ids(channel)
            .await
            .map_err(ArchiveError::from_store)?
            .into_iter()
            .collect();

        let (Some(&min_id), Some(&max_id)) = (stored.first(), stored.last()) else {
            return Ok(CoverageReport::empty(channel));
        };

        let gaps = compute_gaps(&stored, &absent);
        let confirmed_absent = absent.range(min_id..=max_id).copied().collect();

        tracing::debug!(
            channel_id = %channel,
            min_id = %min_id,
            max_id = %max_id,
            stored = stored.len(),
            gaps = gaps.len(),
            "Refreshed archive coverage"
        );

        Ok(CoverageReport {
            channel_id: channel,
            min_id: Some(min_id),
            max_id: Some(max_id),
            stored_count: stored.len(),
            gaps,
            confirmed_absent,
        })
    }

    async fn bounds(&self, channel: ChannelId) -> Result<Option<(MessageId, MessageId)>, ArchiveError> {
        self.store.get_id_bounds(channel).await.map_err(ArchiveError::from_store)
    }

    /// Highest stored id: the exclusive lower bound for forward fetching.
    pub async fn next_new_target(&self, channel: ChannelId) -> Result<Option<MessageId>, ArchiveError> {
        Ok(self.bounds(channel).await?.map(|(_, max)| max))
    }

    /// Lowest stored id: the exclusive upper bound for backward fetching.
    pub async fn next_old_target(&self, channel: ChannelId) -> Result<Option<MessageId>, ArchiveError> {
        Ok(self.bounds(channel).await?.map(|(min, _)| min))
    }

    /// Record every id of `range` that is still missing as confirmed absent.
    ///
    /// Call only after a gap fill has walked the whole range. Only ids inside
    /// current coverage are settled: ids above the newest stored message may
    /// simply not exist yet. Returns the ids newly marked.
    pub async fn settle_gap(&self, channel: ChannelId, range: IdRange) -> Result<Vec<MessageId>, ArchiveError> {
        let Some((min_id, max_id)) = self.bounds(channel).await? else {
            return Ok(Vec::new());
        };
        let Some(window) = IdRange::new(range.start.max(min_id), range.end.min(max_id)) else {
            return Ok(Vec::new());
        };

        let stored = self
            .store
            .get_ids_in_range(channel, window)
            .await
            .map_err(ArchiveError::from_store)?;
        let absent: BTreeSet<MessageId> = self
            .store
            .get_absent_ids_in_range(channel, window)
            .await
            .map_err(ArchiveError::from_store)?
            .into_iter()
            .collect();

        // Fence the window so holes touching its edges are reported too
        let mut fenced = Vec::with_capacity(stored.len() + 2);
        fenced.push(window.start.prev());
        fenced.extend(stored);
        fenced.push(window.end.next());
        fenced.dedup();
        let missing: Vec<MessageId> = compute_gaps(&fenced, &absent)
            .iter()
            .flat_map(IdRange::ids)
            .collect();

        if missing.is_empty() {
            return Ok(missing);
        }

        self.store
            .mark_absent(channel, &missing)
            .await
            .map_err(ArchiveError::from_store)?;

        tracing::info!(
            channel_id = %channel,
            range = %range,
            newly_absent = missing.len(),
            "Settled gap; remaining ids confirmed absent"
        );
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use crate::types::Message;
    use chrono::{TimeZone, Utc};

    const CHAN: ChannelId = ChannelId::new(-1001);

    fn ids(raw: &[i64]) -> Vec<MessageId> {
        raw.iter().copied().map(MessageId::new).collect()
    }

    fn range(a: i64, b: i64) -> IdRange {
        IdRange { start: MessageId::new(a), end: MessageId::new(b) }
    }

    fn make_store(raw: &[i64]) -> Arc<InMemoryMessageStore> {
        Arc::new(InMemoryMessageStore::with_messages(raw.iter().map(|&id| {
            Message::new(CHAN, MessageId::new(id), None, Utc.timestamp_opt(id, 0).unwrap(), "m")
        })))
    }

    #[test]
    fn test_compute_gaps_basic() {
        let gaps = compute_gaps(&ids(&[1, 2, 3, 7, 8, 10]), &BTreeSet::new());
        assert_eq!(gaps, vec![range(4, 6), range(9, 9)]);
    }

    #[test]
    fn test_compute_gaps_carves_out_absent() {
        let absent: BTreeSet<_> = ids(&[5, 9]).into_iter().collect();
        let gaps = compute_gaps(&ids(&[1, 2, 3, 7, 8, 10]), &absent);
        assert_eq!(gaps, vec![range(4, 4), range(6, 6)]);
    }

    #[test]
    fn test_compute_gaps_absent_at_edges() {
        let absent: BTreeSet<_> = ids(&[2, 6]).into_iter().collect();
        let gaps = compute_gaps(&ids(&[1, 7]), &absent);
        assert_eq!(gaps, vec![range(3, 5)]);
    }

    #[test]
    fn test_compute_gaps_contiguous_and_single() {
        assert!(compute_gaps(&ids(&[1, 2, 3]), &BTreeSet::new()).is_empty());
        assert!(compute_gaps(&ids(&[42]), &BTreeSet::new()).is_empty());
        assert!(compute_gaps(&[], &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_compute_gaps_opposite_sign_extremes() {
        let gaps = compute_gaps(&[MessageId::new(i64::MIN), MessageId::new(i64::MAX)], &BTreeSet::new());
        assert_eq!(
            gaps,
            vec![IdRange { start: MessageId::new(i64::MIN + 1), end: MessageId::new(i64::MAX - 1) }]
        );
    }

    #[tokio::test]
    async fn test_refresh_empty_channel() {
        let state = ArchiveState::new(Arc::new(InMemoryMessageStore::new()));
        let report = state.refresh(CHAN).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(report.min_id, None);
        assert_eq!(report.max_id, None);
        assert!(report.gaps.is_empty());
        assert_eq!(state.next_new_target(CHAN).await.unwrap(), None);
        assert_eq!(state.next_old_target(CHAN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_reports_bounds_and_gaps() {
        let state = ArchiveState::new(make_store(&[1, 2, 3, 7, 8, 10]));
        let report = state.refresh(CHAN).await.unwrap();

        assert_eq!(report.min_id, Some(MessageId::new(1)));
        assert_eq!(report.max_id, Some(MessageId::new(10)));
        assert_eq!(report.stored_count, 6);
        assert_eq!(report.gaps, vec![range(4, 6), range(9, 9)]);
        assert_eq!(report.missing_count(), 4);
        assert_eq!(state.next_new_target(CHAN).await.unwrap(), Some(MessageId::new(10)));
        assert_eq!(state.next_old_target(CHAN).await.unwrap(), Some(MessageId::new(1)));
    }

    #[tokio::test]
    async fn test_settle_gap_marks_only_missing_ids_in_range() {
        let store = make_store(&[1, 2, 3, 4, 6, 7, 8, 10]);
        let state = ArchiveState::new(Arc::clone(&store));

        let newly = state.settle_gap(CHAN, range(4, 6)).await.unwrap();
        assert_eq!(newly, ids(&[5]));

        let report = state.refresh(CHAN).await.unwrap();
        assert_eq!(report.gaps, vec![range(9, 9)]);
        assert_eq!(report.confirmed_absent, ids(&[5]));
        assert_eq!(report.absent_ranges(), vec![range(5, 5)]);
    }

    #[tokio::test]
    async fn test_settle_gap_ignores_ids_beyond_coverage() {
        let store = make_store(&[1, 2, 3]);
        let state = ArchiveState::new(Arc::clone(&store));

        let newly = state.settle_gap(CHAN, range(2, 50)).await.unwrap();
        assert!(newly.is_empty());
        assert!(store.get_absent_ids(CHAN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settle_gap_inside_wide_hole_skips_known_absent() {
        let store = make_store(&[1, 10]);
        store.mark_absent(CHAN, &ids(&[5])).await.unwrap();
        let state = ArchiveState::new(Arc::clone(&store));

        let newly = state.settle_gap(CHAN, range(4, 6)).await.unwrap();
        assert_eq!(newly, ids(&[4, 6]));

        let report = state.refresh(CHAN).await.unwrap();
        assert_eq!(report.gaps, vec![range(2, 3), range(7, 9)]);
        assert_eq!(report.absent_ranges(), vec![range(4, 6)]);
    }

    #[tokio::test]
    async fn test_refresh_surfaces_storage_unavailable() {
        let store = make_store(&[1]);
        store.set_available(false);
        let state = ArchiveState::new(store);
        let err = state.refresh(CHAN).await.unwrap_err();
        assert!(matches!(err, ArchiveError::StorageUnavailable(_)));
    }
}
