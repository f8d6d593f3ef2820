//! Ordered bar sequences keyed by (symbol, market, interval).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bar::Bar;
use super::interval::Interval;
use super::market::MarketType;
use super::range::TimeRange;

/// Identity of a bar series.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub market: MarketType,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, market: MarketType, interval: Interval) -> Self {
        Self {
            symbol: symbol.into().to_ascii_uppercase(),
            market,
            interval,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.symbol, self.market, self.interval)
    }
}

/// Why a sequence of bars is not a valid series.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeriesViolation {
    Duplicate { at: DateTime<Utc> },
    NonMonotonic { at: DateTime<Utc> },
    Misaligned { at: DateTime<Utc> },
}

impl fmt::Display for SeriesViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate { at } => write!(f, "duplicate open time {}", at),
            Self::NonMonotonic { at } => write!(f, "open time {} goes backwards", at),
            Self::Misaligned { at } => write!(f, "open time {} is off the interval grid", at),
        }
    }
}

/// Bars for one key with strictly increasing open times.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarSeries {
    pub key: SeriesKey,
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new(key: SeriesKey) -> Self {
        Self {
            key,
            bars: Vec::new(),
        }
    }

    /// Sorts and deduplicates; for a repeated open time the later bar wins.
    pub fn from_bars(key: SeriesKey, mut bars: Vec<Bar>) -> Self {
        // Stable sort keeps arrival order among equal timestamps.
        bars.sort_by_key(|b| b.open_time);
        let mut deduped: Vec<Bar> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.open_time == bar.open_time => *last = bar,
                _ => deduped.push(bar),
            }
        }
        Self { key, bars: deduped }
    }

    /// Wraps bars as-is, checking every invariant instead of repairing.
    pub fn try_from_ordered(key: SeriesKey, bars: Vec<Bar>) -> Result<Self, SeriesViolation> {
        let series = Self { key, bars };
        series.validate()?;
        Ok(series)
    }

    pub fn validate(&self) -> Result<(), SeriesViolation> {
        let interval = self.key.interval;
        let mut previous: Option<DateTime<Utc>> = None;
        for bar in &self.bars {
            if !interval.is_aligned(bar.open_time) {
                return Err(SeriesViolation::Misaligned { at: bar.open_time });
            }
            if let Some(prev) = previous {
                if bar.open_time == prev {
                    return Err(SeriesViolation::Duplicate { at: bar.open_time });
                }
                if bar.open_time < prev {
                    return Err(SeriesViolation::NonMonotonic { at: bar.open_time });
                }
            }
            previous = Some(bar.open_time);
        }
        Ok(())
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_open(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.open_time)
    }

    pub fn last_open(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.open_time)
    }

    /// Bars whose open time falls in `range`.
    pub fn slice(&self, range: &TimeRange) -> BarSeries {
        Self {
            key: self.key.clone(),
            bars: self
                .bars
                .iter()
                .filter(|b| range.contains(b.open_time))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceKind;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn key() -> SeriesKey {
        SeriesKey::new("btcusdt", MarketType::Spot, Interval::Minute1)
    }

    fn bar(minute: i64, close: rust_decimal::Decimal) -> Bar {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Bar {
            open_time: base + Duration::minutes(minute),
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            trade_count: Some(1),
            provenance: SourceKind::Live,
        }
    }

    #[test]
    fn test_key_uppercases_symbol() {
        assert_eq!(key().to_string(), "BTCUSDT/spot/1m");
    }

    #[test]
    fn test_from_bars_sorts_and_keeps_later_duplicate() {
        let series = BarSeries::from_bars(
            key(),
            vec![bar(2, dec!(3)), bar(0, dec!(1)), bar(2, dec!(4)), bar(1, dec!(2))],
        );
        let closes: Vec<_> = series.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(1), dec!(2), dec!(4)]);
        assert!(series.validate().is_ok());
    }

    #[test]
    fn test_try_from_ordered_rejects_duplicates_and_disorder() {
        let dup = BarSeries::try_from_ordered(key(), vec![bar(0, dec!(1)), bar(0, dec!(1))]);
        assert!(matches!(dup, Err(SeriesViolation::Duplicate { .. })));

        let backwards =
            BarSeries::try_from_ordered(key(), vec![bar(3, dec!(1)), bar(1, dec!(1))]);
        assert!(matches!(backwards, Err(SeriesViolation::NonMonotonic { .. })));
    }

    #[test]
    fn test_misaligned_bar_is_rejected() {
        let mut off_grid = bar(0, dec!(1));
        off_grid.open_time += Duration::seconds(7);
        let result = BarSeries::try_from_ordered(key(), vec![off_grid]);
        assert!(matches!(result, Err(SeriesViolation::Misaligned { .. })));
    }

    #[test]
    fn test_slice_is_half_open() {
        let series = BarSeries::from_bars(key(), (0..5).map(|m| bar(m, dec!(1))).collect());
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let sliced = series.slice(&TimeRange::new(
            base + Duration::minutes(1),
            base + Duration::minutes(3),
        ));
        assert_eq!(sliced.len(), 2);
        assert_eq!(sliced.first_open(), Some(base + Duration::minutes(1)));
    }
}
