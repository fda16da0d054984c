use serde::{Deserialize, Serialize};

/// One contiguous span of bytes present in the local cache file.
///
/// Both bounds are inclusive and `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "invalid byte range {}..={}", start, end);
        Self { start, end }
    }

    /// Number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `[start, start + length - 1]` lies entirely inside this range.
    pub fn contains_span(&self, start: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.start <= start && self.end >= start + length - 1
    }
}

/// Ordered, coalesced set of downloaded byte ranges.
///
/// Invariant: after every mutation the ranges are sorted ascending by `start`
/// and pairwise non-overlapping and non-adjacent (`next.start > prev.end + 1`).
/// `insert` re-merges immediately, so the set is never observable in an
/// uncoalesced state. Coverage queries rely on that: a span is considered
/// covered only when a single range contains it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Record `length` bytes starting at `offset` as downloaded.
    ///
    /// Zero-length inserts are ignored.
    pub fn insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        self.ranges.push(ByteRange::new(offset, offset + length - 1));
        self.merge();
    }

    /// Sort and coalesce overlapping or byte-adjacent ranges.
    fn merge(&mut self) {
        if self.ranges.is_empty() {
            return;
        }

        self.ranges.sort_by_key(|r| r.start);

        let mut merged = Vec::with_capacity(self.ranges.len());
        let mut current = self.ranges[0];

        for &range in &self.ranges[1..] {
            if range.start <= current.end + 1 {
                // Overlapping or adjacent - extend the candidate
                current.end = std::cmp::max(current.end, range.end);
            } else {
                merged.push(current);
                current = range;
            }
        }
        merged.push(current);

        self.ranges = merged;
    }

    /// Whether the span `[start, start + length - 1]` is entirely cached.
    ///
    /// A length of 0 is trivially covered.
    pub fn is_fully_covered(&self, start: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.ranges.iter().any(|r| r.contains_span(start, length))
    }

    /// Total number of cached bytes across all ranges.
    pub fn total_cached_bytes(&self) -> u64 {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_of(set: &RangeSet) -> Vec<(u64, u64)> {
        set.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_insert_merges_adjacent_ranges() {
        let mut set = RangeSet::new();
        set.insert(0, 100); // [0, 99]
        set.insert(300, 100); // [300, 399]
        set.insert(100, 100); // [100, 199] - adjacent to [0, 99]

        assert_eq!(ranges_of(&set), vec![(0, 199), (300, 399)]);
        assert_eq!(set.total_cached_bytes(), 300);
    }

    #[test]
    fn test_merge_order_independent() {
        let spans = [(0u64, 100u64), (100, 100), (300, 100)];

        // Same result for every insertion order
        for perm in [
            [0usize, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ] {
            let mut set = RangeSet::new();
            for &i in &perm {
                set.insert(spans[i].0, spans[i].1);
            }
            assert_eq!(ranges_of(&set), vec![(0, 199), (300, 399)]);
        }
    }

    #[test]
    fn test_merge_idempotent() {
        let mut set = RangeSet::new();
        set.insert(0, 50);
        set.insert(25, 100);
        set.insert(500, 10);

        let before = ranges_of(&set);
        set.merge();
        assert_eq!(ranges_of(&set), before);
    }

    #[test]
    fn test_overlapping_ranges_merge() {
        let mut set = RangeSet::new();
        set.insert(0, 100); // [0, 99]
        set.insert(200, 100); // [200, 299]
        set.insert(90, 121); // [90, 210] - bridges both

        assert_eq!(ranges_of(&set), vec![(0, 299)]);
        assert_eq!(set.total_cached_bytes(), 300);
    }

    #[test]
    fn test_is_fully_covered() {
        let mut set = RangeSet::new();
        set.insert(0, 200); // [0, 199]

        assert!(set.is_fully_covered(50, 100)); // [50, 149]
        assert!(set.is_fully_covered(0, 200)); // exact
        assert!(!set.is_fully_covered(150, 100)); // [150, 249] past end
        assert!(!set.is_fully_covered(200, 1)); // just past end
    }

    #[test]
    fn test_zero_length_trivially_covered() {
        let set = RangeSet::new();
        assert!(set.is_fully_covered(0, 0));
        assert!(set.is_fully_covered(12345, 0));
    }

    #[test]
    fn test_zero_length_insert_ignored() {
        let mut set = RangeSet::new();
        set.insert(100, 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_coverage_requires_single_range() {
        // Non-adjacent ranges never coalesce, so a span across the gap
        // is not covered.
        let mut set = RangeSet::new();
        set.insert(0, 100); // [0, 99]
        set.insert(101, 100); // [101, 200], gap at byte 100

        assert_eq!(set.len(), 2);
        assert!(!set.is_fully_covered(0, 201));
        assert!(!set.is_fully_covered(50, 100));
    }
}
