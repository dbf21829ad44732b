//! Coverage tracking: which portion of the log has already been folded.

use serde::{Deserialize, Serialize};

/// A closed interval of covered local ids, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRange {
    /// Inclusive lower bound.
    pub start: u64,
    /// Inclusive upper bound.
    pub end: u64,
}

impl CoverageRange {
    /// Construct a range; `start` must not exceed `end`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        CoverageRange { start, end }
    }
}

/// The lowest not-yet-covered interval, nearest the origin.
///
/// `end == None` means the gap is unbounded above — nothing has ever been
/// covered and the whole log is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Inclusive lower bound.
    pub start: u64,
    /// Inclusive upper bound, `None` for unbounded.
    pub end: Option<u64>,
}

/// Pure algebra over disjoint closed integer intervals, origin 0.
///
/// Invariant: the range list is sorted ascending by start, pairwise
/// non-overlapping and non-adjacent — any two intervals within distance 1
/// of each other are already merged into one. Coverage only grows; nothing
/// in this type ever shrinks it.
///
/// Local ids start at 1, so id 0 never corresponds to a record. Any
/// interval starting at 1 is recorded from 0 (it is adjacent to the origin
/// under the distance-1 algebra); this keeps "covered contiguously from
/// the origin" reachable from every delivery path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageTracker {
    ranges: Vec<CoverageRange>,
}

impl CoverageTracker {
    /// An empty tracker: nothing covered yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a tracker from persisted ranges.
    ///
    /// Each range is re-inserted through the merge algebra, so an
    /// out-of-order or overlapping persisted list still normalizes.
    pub fn from_ranges(ranges: impl IntoIterator<Item = CoverageRange>) -> Self {
        let mut tracker = Self::new();
        for range in ranges {
            tracker.insert(range.start, range.end);
        }
        tracker
    }

    /// The current range list, sorted ascending and fully merged.
    pub fn ranges(&self) -> &[CoverageRange] {
        &self.ranges
    }

    /// Merge `[start, end]` into the list.
    ///
    /// Sort-and-sweep over the (typically small) fragment count: any two
    /// intervals whose gap is ≤ 1 coalesce into one. Commutative and
    /// idempotent over overlapping and duplicate inserts, which is what
    /// makes live/catch-up interleavings near the same boundary safe.
    pub fn insert(&mut self, start: u64, end: u64) {
        debug_assert!(start <= end);
        // Origin adjacency: id 0 never exists, a range touching 1 covers
        // everything below it.
        let start = if start <= 1 { 0 } else { start };

        self.ranges.push(CoverageRange::new(start, end));
        self.ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<CoverageRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    /// True when the list is exactly one interval starting at the origin.
    ///
    /// This is only half of "fully covered" — whether further log entries
    /// exist beyond the interval's end is resolved by the engine, which
    /// can see the log.
    pub fn is_contiguous_from_origin(&self) -> bool {
        matches!(self.ranges.as_slice(), [r] if r.start == 0)
    }

    /// Highest id guaranteed covered contiguously from the origin, if any.
    pub fn frontier(&self) -> Option<u64> {
        match self.ranges.first() {
            Some(r) if r.start == 0 => Some(r.end),
            _ => None,
        }
    }

    /// The gap immediately below the newest covered interval.
    ///
    /// Empty list: everything is outstanding, `[0, +∞)`. One interval
    /// starting at the origin: no gap (anything above it is the live
    /// path's business). One interval starting above the origin: the hole
    /// below it. Two or more intervals: the hole between the second-to-
    /// last and the last. Backward catch-up fills that hole, the two
    /// intervals coalesce, and the next older hole surfaces.
    pub fn find_gap(&self) -> Option<Gap> {
        match self.ranges.as_slice() {
            [] => Some(Gap {
                start: 0,
                end: None,
            }),
            [r] if r.start == 0 => None,
            [r] => Some(Gap {
                start: 0,
                end: Some(r.start - 1),
            }),
            [.., a, b] => Some(Gap {
                start: a.end + 1,
                end: Some(b.start - 1),
            }),
        }
    }
}
