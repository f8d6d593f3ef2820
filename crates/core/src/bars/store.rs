//! Bar cache storage traits.
//!
//! This module defines the storage interface for cached bar series. The
//! orchestrator only ever talks to the cache through [`CacheStore`], so the
//! persisted layout is up to the implementation.

use async_trait::async_trait;
use barvault_market_data::{BarSeries, Coverage, SeriesKey, TimeRange};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::Result;

/// What the cache holds for one series.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub bars: usize,
    pub coverage: Coverage,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Storage interface for cached bars.
///
/// # Design Notes
///
/// - A miss is not an error: `get` returns an empty series with empty coverage
/// - `put` is range-atomic: bars and the coverage they fill land together or
///   not at all, so coverage never claims a range whose bars are missing
/// - Writes for one key are serialized; overlapping puts reconcile per open
///   time, and a stored `archive` bar is never replaced by a `live` one
/// - Stored records that break series invariants surface as
///   `Error::CorruptCacheRecord` instead of being served
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Bars and covered subranges of `range`.
    async fn get(&self, key: &SeriesKey, range: &TimeRange) -> Result<(BarSeries, Coverage)>;

    /// Merges `series` into the store and marks `coverage` as filled.
    ///
    /// Bars outside `coverage` are still stored; coverage is what later reads
    /// trust.
    async fn put(&self, series: &BarSeries, coverage: &Coverage) -> Result<()>;

    /// Drops bars and coverage for `range`.
    async fn invalidate(&self, key: &SeriesKey, range: &TimeRange) -> Result<()>;

    async fn stats(&self, key: &SeriesKey) -> Result<CacheStats>;
}
