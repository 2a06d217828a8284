//! # Time Ranges
//!
//! Normalised sets of buffered `[start, end)` intervals, the way a media buffer
//! reports what it holds.

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing media times (one frame at 30 fps).
pub const TIME_FUDGE_FACTOR: f64 = 1.0 / 30.0;

/// Wider tolerance used when deciding whether a time falls in a buffered range.
pub const SAFE_TIME_DELTA: f64 = TIME_FUDGE_FACTOR * 3.0;

/// Ordered, non-overlapping time ranges in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRanges {
    ranges: Vec<(f64, f64)>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from arbitrary intervals; empty ones are dropped and overlapping or
    /// touching ones merged.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut result = Self::new();
        for (start, end) in ranges {
            result.insert(start, end);
        }
        result
    }

    pub fn single(start: f64, end: f64) -> Self {
        Self::from_ranges([(start, end)])
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn get(&self, index: usize) -> Option<(f64, f64)> {
        self.ranges.get(index).copied()
    }

    /// Start of the first range.
    pub fn first_start(&self) -> Option<f64> {
        self.ranges.first().map(|r| r.0)
    }

    /// End of the last range.
    pub fn last_end(&self) -> Option<f64> {
        self.ranges.last().map(|r| r.1)
    }

    /// Sum of all range lengths.
    pub fn total_duration(&self) -> f64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn insert(&mut self, start: f64, end: f64) {
        if !(end > start) {
            return;
        }
        let mut merged = (start, end);
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e < merged.0 || s > merged.1 {
                kept.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        kept.push(merged);
        kept.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.ranges = kept;
    }

    /// Subtract `[start, end)` from the set.
    pub fn remove(&mut self, start: f64, end: f64) {
        if !(end > start) {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                kept.push((s, e));
                continue;
            }
            if s < start {
                kept.push((s, start));
            }
            if e > end {
                kept.push((end, e));
            }
        }
        self.ranges = kept;
    }

    /// Intervals present in both sets.
    pub fn intersection(&self, other: &TimeRanges) -> TimeRanges {
        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if end > start {
                result.push((start, end));
            }
            if a_end < b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        TimeRanges { ranges: result }
    }

    /// The range containing `time`, allowing [`SAFE_TIME_DELTA`] of slack on
    /// both edges.
    pub fn find_range(&self, time: f64) -> Option<(f64, f64)> {
        self.ranges
            .iter()
            .copied()
            .find(|&(start, end)| start - SAFE_TIME_DELTA <= time && end + SAFE_TIME_DELTA >= time)
    }

    /// Seconds of contiguous content buffered ahead of `time`.
    pub fn time_ahead_of(&self, time: f64) -> f64 {
        self.find_range(time)
            .map(|(_, end)| (end - time).max(0.0))
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_overlapping_ranges() {
        let mut ranges = TimeRanges::new();
        ranges.insert(10.0, 20.0);
        ranges.insert(0.0, 5.0);
        ranges.insert(18.0, 25.0);
        ranges.insert(5.0, 6.0);
        assert_eq!(
            ranges.iter().collect::<Vec<_>>(),
            vec![(0.0, 6.0), (10.0, 25.0)]
        );
    }

    #[test]
    fn test_empty_interval_is_ignored() {
        let ranges = TimeRanges::from_ranges([(3.0, 3.0), (5.0, 4.0)]);
        assert!(ranges.is_empty());
        assert_eq!(ranges.last_end(), None);
    }

    #[test]
    fn test_remove_splits_range() {
        let mut ranges = TimeRanges::single(0.0, 30.0);
        ranges.remove(10.0, 20.0);
        assert_eq!(
            ranges.iter().collect::<Vec<_>>(),
            vec![(0.0, 10.0), (20.0, 30.0)]
        );
        ranges.remove(0.0, 100.0);
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_intersection() {
        let audio = TimeRanges::from_ranges([(0.0, 10.0), (12.0, 30.0)]);
        let video = TimeRanges::from_ranges([(1.0, 20.0), (25.0, 40.0)]);
        assert_eq!(
            audio.intersection(&video).iter().collect::<Vec<_>>(),
            vec![(1.0, 10.0), (12.0, 20.0), (25.0, 30.0)]
        );
        assert!(audio.intersection(&TimeRanges::new()).is_empty());
    }

    #[test]
    fn test_time_ahead_of() {
        let ranges = TimeRanges::from_ranges([(0.0, 31.0), (40.0, 50.0)]);
        assert_eq!(ranges.time_ahead_of(0.0), 31.0);
        assert_eq!(ranges.time_ahead_of(45.0), 5.0);
        assert_eq!(ranges.time_ahead_of(35.0), 0.0);
        // Slightly before a range still counts as inside it.
        assert!((ranges.time_ahead_of(39.95) - 10.05).abs() < 1e-9);
    }
}
