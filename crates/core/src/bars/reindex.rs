//! Gap detection and reindexing.
//!
//! The canonical index of a range is every bar boundary from `align(start)`
//! up to (excluding) `align(end)`, stepped with the interval's resample rule.
//! Input bars are placed onto that index; positions with no bar are grouped
//! into maximal runs and reported as gaps. Nothing here invents bar values.

use barvault_market_data::{Bar, BarSeries, Interval, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A maximal run of expected but missing bars.
///
/// `end` is the open time of the last missing bar, so a single missing bar
/// has `start == end`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub missing_bars: usize,
}

impl Gap {
    /// The half-open range a repair fetch should ask for.
    pub fn window(&self, interval: Interval) -> TimeRange {
        TimeRange::new(self.start, interval.advance(self.end, 1))
    }
}

/// A series laid onto its canonical index.
#[derive(Clone, Debug)]
pub struct Reindexed {
    pub index: Vec<DateTime<Utc>>,
    /// One slot per index entry; `None` where no bar exists.
    pub slots: Vec<Option<Bar>>,
    pub gaps: Vec<Gap>,
}

impl Reindexed {
    pub fn filled(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Expected open times for `range`.
pub fn canonical_index(interval: Interval, range: &TimeRange) -> Vec<DateTime<Utc>> {
    let rule = interval.resample_rule();
    let first = rule.floor(range.start);
    let end = rule.floor(range.end);

    let mut index = Vec::with_capacity(interval.bars_between(first, end));
    let mut open = first;
    while open < end {
        index.push(open);
        open = rule.step(open, 1);
    }
    index
}

/// Places the bars of `series` onto the canonical index of `range`.
///
/// Bars off the grid or outside the range are ignored. The input need not be
/// sorted; for duplicate open times the later bar is kept.
pub fn reindex(series: &BarSeries, range: &TimeRange) -> Reindexed {
    let interval = series.key.interval;
    let index = canonical_index(interval, range);

    let mut bars: Vec<&Bar> = series.bars().iter().collect();
    bars.sort_by_key(|b| b.open_time);

    let mut slots: Vec<Option<Bar>> = vec![None; index.len()];
    for bar in bars {
        if let Ok(pos) = index.binary_search(&bar.open_time) {
            slots[pos] = Some(bar.clone());
        }
    }

    let gaps = collect_gaps(&index, &slots);
    Reindexed { index, slots, gaps }
}

/// Gaps of `series` within `range`.
pub fn detect_gaps(series: &BarSeries, range: &TimeRange) -> Vec<Gap> {
    reindex(series, range).gaps
}

fn collect_gaps(index: &[DateTime<Utc>], slots: &[Option<Bar>]) -> Vec<Gap> {
    let mut gaps = Vec::new();
    let mut run: Option<(usize, usize)> = None;

    for (pos, slot) in slots.iter().enumerate() {
        match (slot, run) {
            (None, None) => run = Some((pos, pos)),
            (None, Some((first, _))) => run = Some((first, pos)),
            (Some(_), Some((first, last))) => {
                gaps.push(gap(index, first, last));
                run = None;
            }
            (Some(_), None) => {}
        }
    }
    if let Some((first, last)) = run {
        gaps.push(gap(index, first, last));
    }
    gaps
}

fn gap(index: &[DateTime<Utc>], first: usize, last: usize) -> Gap {
    Gap {
        start: index[first],
        end: index[last],
        missing_bars: last - first + 1,
    }
}
