//! Inclusive message id ranges.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::message::MessageId;

/// An inclusive range of message ids `[start, end]`.
///
/// Used for gap reports and gap-fill requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdRange {
    /// First id in the range.
    pub start: MessageId,
    /// Last id in the range (inclusive).
    pub end: MessageId,
}

impl IdRange {
    /// Create a range. Returns `None` when `start > end`.
    pub fn new(start: MessageId, end: MessageId) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Single-id range.
    pub fn single(id: MessageId) -> Self {
        Self { start: id, end: id }
    }

    /// Number of ids covered.
    pub fn len(&self) -> u64 {
        self.end.get().abs_diff(self.start.get()) + 1
    }

    /// Ranges are never empty; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `id` lies inside the range.
    pub fn contains(&self, id: MessageId) -> bool {
        self.start <= id && id <= self.end
    }

    /// Iterate every id in the range.
    pub fn ids(&self) -> impl Iterator<Item = MessageId> {
        (self.start.get()..=self.end.get()).map(MessageId::new)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Merge overlapping or adjacent ranges into a sorted, disjoint list.
pub fn merge_ranges(mut ranges: Vec<IdRange>) -> Vec<IdRange> {
    ranges.sort();
    let mut merged: Vec<IdRange> = Vec::with_capacity(ranges.len());
    for current in ranges {
        match merged.last_mut() {
            Some(last) if current.start.get() <= last.end.get().saturating_add(1) => {
                if current.end > last.end {
                    last.end = current.end;
                }
            }
            _ => merged.push(current),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: i64, b: i64) -> IdRange {
        IdRange::new(MessageId::new(a), MessageId::new(b)).unwrap()
    }

    #[test]
    fn test_rejects_inverted_range() {
        assert!(IdRange::new(MessageId::new(5), MessageId::new(4)).is_none());
        assert_eq!(r(4, 6).len(), 3);
        assert_eq!(IdRange::single(MessageId::new(9)).len(), 1);
    }

    #[test]
    fn test_merge_adjacent_and_overlapping() {
        let merged = merge_ranges(vec![r(10, 12), r(1, 3), r(4, 5), r(11, 20), r(30, 30)]);
        assert_eq!(merged, vec![r(1, 5), r(10, 20), r(30, 30)]);
    }

    #[test]
    fn test_display() {
        assert_eq!(r(4, 6).to_string(), "4-6");
        assert_eq!(r(9, 9).to_string(), "9");
    }
}
