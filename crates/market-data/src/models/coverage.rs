//! Which parts of a requested range a source actually delivered.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::range::TimeRange;

/// A set of time ranges kept sorted, disjoint and non-adjacent.
///
/// Default = "nothing covered".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    ranges: Vec<TimeRange>,
}

impl Coverage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_range(range: TimeRange) -> Self {
        let mut coverage = Self::empty();
        coverage.insert(range);
        coverage
    }

    pub fn from_ranges<I: IntoIterator<Item = TimeRange>>(ranges: I) -> Self {
        let mut coverage = Self::empty();
        for range in ranges {
            coverage.insert(range);
        }
        coverage
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Adds `range`, merging with anything it overlaps or touches.
    pub fn insert(&mut self, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if existing.end < merged.start || merged.end < existing.start {
                kept.push(existing);
            } else {
                merged = TimeRange::new(
                    merged.start.min(existing.start),
                    merged.end.max(existing.end),
                );
            }
        }
        kept.push(merged);
        kept.sort_by_key(|r| r.start);
        self.ranges = kept;
    }

    pub fn union(&mut self, other: &Coverage) {
        for range in &other.ranges {
            self.insert(*range);
        }
    }

    /// Removes `range` from the set, splitting ranges that straddle it.
    pub fn subtract(&mut self, range: &TimeRange) {
        if range.is_empty() {
            return;
        }
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for existing in self.ranges.drain(..) {
            if !existing.overlaps(range) {
                kept.push(existing);
                continue;
            }
            let (left, _) = existing.split_at(range.start);
            let (_, right) = existing.split_at(range.end);
            if !left.is_empty() {
                kept.push(left);
            }
            if !right.is_empty() {
                kept.push(right);
            }
        }
        self.ranges = kept;
    }

    /// The part of this coverage that falls within `range`.
    pub fn clip(&self, range: &TimeRange) -> Coverage {
        Coverage {
            ranges: self
                .ranges
                .iter()
                .filter_map(|r| r.intersect(range))
                .collect(),
        }
    }

    /// Subranges of `range` this coverage does not contain, in order.
    pub fn complement(&self, range: &TimeRange) -> Vec<TimeRange> {
        if range.is_empty() {
            return Vec::new();
        }
        let mut missing = Vec::new();
        let mut cursor = range.start;
        for covered in self.ranges.iter().filter(|r| r.overlaps(range)) {
            if covered.start > cursor {
                missing.push(TimeRange::new(cursor, covered.start));
            }
            cursor = cursor.max(covered.end);
        }
        if cursor < range.end {
            missing.push(TimeRange::new(cursor, range.end));
        }
        missing
    }

    pub fn covers(&self, range: &TimeRange) -> bool {
        range.is_empty() || self.ranges.iter().any(|r| r.encloses(range))
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("{}");
        }
        let parts: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}
