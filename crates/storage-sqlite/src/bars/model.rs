//! Database models for cached bars and coverage.

use std::str::FromStr;

use barvault_market_data::{Bar, SeriesKey, SourceKind, TimeRange};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;

/// One cached bar. Times are epoch milliseconds, decimals are stored as text
/// so no precision is lost.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::cache_bars)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CacheBarDB {
    pub symbol: String,
    pub market: String,
    pub interval: String,
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub trade_count: Option<i64>,
    pub provenance: String,
}

impl CacheBarDB {
    /// Columns bound per inserted row.
    pub const COLUMNS: usize = 11;

    pub fn from_bar(key: &SeriesKey, bar: &Bar) -> Self {
        Self {
            symbol: key.symbol.clone(),
            market: key.market.as_str().to_string(),
            interval: key.interval.as_str().to_string(),
            open_time: bar.open_time.timestamp_millis(),
            open: bar.open.to_string(),
            high: bar.high.to_string(),
            low: bar.low.to_string(),
            close: bar.close.to_string(),
            volume: bar.volume.to_string(),
            trade_count: bar.trade_count.map(|n| i64::try_from(n).unwrap_or(i64::MAX)),
            provenance: bar.provenance.as_str().to_string(),
        }
    }

    /// Decodes the row; the error names the first field that does not parse.
    pub fn into_bar(self) -> Result<Bar, String> {
        let open_time = from_millis(self.open_time)?;
        let decimal = |field: &str, raw: &str| {
            Decimal::from_str(raw).map_err(|e| {
                format!("{} at {} is not a decimal ('{}'): {}", field, open_time, raw, e)
            })
        };
        let trade_count = self
            .trade_count
            .map(|n| {
                u64::try_from(n).map_err(|_| format!("negative trade count {} at {}", n, open_time))
            })
            .transpose()?;
        let provenance = SourceKind::from_str(&self.provenance).map_err(|e| e.to_string())?;

        Ok(Bar {
            open_time,
            open: decimal("open", &self.open)?,
            high: decimal("high", &self.high)?,
            low: decimal("low", &self.low)?,
            close: decimal("close", &self.close)?,
            volume: decimal("volume", &self.volume)?,
            trade_count,
            provenance,
        })
    }
}

/// One covered range of a series.
#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = crate::schema::cache_coverage)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CoverageRowDB {
    pub symbol: String,
    pub market: String,
    pub interval: String,
    pub range_start: i64,
    pub range_end: i64,
    pub updated_at: String,
}

impl CoverageRowDB {
    pub fn new(key: &SeriesKey, range: &TimeRange, updated_at: DateTime<Utc>) -> Self {
        Self {
            symbol: key.symbol.clone(),
            market: key.market.as_str().to_string(),
            interval: key.interval.as_str().to_string(),
            range_start: range.start.timestamp_millis(),
            range_end: range.end.timestamp_millis(),
            updated_at: updated_at.to_rfc3339(),
        }
    }

    pub fn range(&self) -> Result<TimeRange, String> {
        let start = from_millis(self.range_start)?;
        let end = from_millis(self.range_end)?;
        if end <= start {
            return Err(format!("coverage range [{}, {}) is empty", start, end));
        }
        Ok(TimeRange::new(start, end))
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.updated_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("timestamp {} is out of range", ms))
}
