use async_trait::async_trait;
use barvault_core::bars::{should_replace, CacheStats, CacheStore};
use barvault_core::errors::{Error, Result};
use barvault_market_data::{
    BarSeries, Clock, Coverage, SeriesKey, SourceKind, SystemClock, TimeRange,
};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, warn};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::model::{CacheBarDB, CoverageRowDB};
use crate::db::{create_pool, get_connection, run_migrations, spawn_writer, DbPool, WriteHandle};
use crate::errors::IntoCore;
use crate::schema::cache_bars::dsl as bars_dsl;
use crate::schema::cache_coverage::dsl as coverage_dsl;
use crate::utils::chunk_for_insert;

/// Bar cache persisted in SQLite.
///
/// Reads go through the pool; every mutation is one job on the writer actor,
/// so bars and the coverage they fill commit together.
pub struct SqliteCacheStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    clock: Arc<dyn Clock>,
}

impl SqliteCacheStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self {
            pool,
            writer,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamps coverage refreshes with `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens (and migrates) the database at `db_path` and starts its writer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(db_path: &str) -> Result<Self> {
        let pool = create_pool(db_path)?;
        run_migrations(&pool)?;
        let writer = spawn_writer((*pool).clone());
        Ok(Self::new(pool, writer))
    }
}

fn corrupt(key: &SeriesKey, message: impl Into<String>) -> Error {
    Error::CorruptCacheRecord {
        key: key.to_string(),
        message: message.into(),
    }
}

fn load_coverage_rows(conn: &mut SqliteConnection, key: &SeriesKey) -> Result<Vec<CoverageRowDB>> {
    coverage_dsl::cache_coverage
        .filter(coverage_dsl::symbol.eq(&key.symbol))
        .filter(coverage_dsl::market.eq(key.market.as_str()))
        .filter(coverage_dsl::interval.eq(key.interval.as_str()))
        .order(coverage_dsl::range_start.asc())
        .select(CoverageRowDB::as_select())
        .load(conn)
        .into_core()
}

fn load_coverage(conn: &mut SqliteConnection, key: &SeriesKey) -> Result<Coverage> {
    let ranges = load_coverage_rows(conn, key)?
        .iter()
        .map(CoverageRowDB::range)
        .collect::<std::result::Result<Vec<_>, String>>()
        .map_err(|message| corrupt(key, message))?;
    Ok(Coverage::from_ranges(ranges))
}

/// Replaces the stored coverage of `key` with `coverage`, stamped `now`.
fn rewrite_coverage(
    conn: &mut SqliteConnection,
    key: &SeriesKey,
    coverage: &Coverage,
    now: DateTime<Utc>,
) -> Result<()> {
    diesel::delete(
        coverage_dsl::cache_coverage
            .filter(coverage_dsl::symbol.eq(&key.symbol))
            .filter(coverage_dsl::market.eq(key.market.as_str()))
            .filter(coverage_dsl::interval.eq(key.interval.as_str())),
    )
    .execute(conn)
    .into_core()?;

    let rows: Vec<CoverageRowDB> = coverage
        .ranges()
        .iter()
        .map(|range| CoverageRowDB::new(key, range, now))
        .collect();
    if !rows.is_empty() {
        diesel::insert_into(coverage_dsl::cache_coverage)
            .values(&rows)
            .execute(conn)
            .into_core()?;
    }
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &SeriesKey, range: &TimeRange) -> Result<(BarSeries, Coverage)> {
        let mut conn = get_connection(&self.pool)?;

        let rows: Vec<CacheBarDB> = bars_dsl::cache_bars
            .filter(bars_dsl::symbol.eq(&key.symbol))
            .filter(bars_dsl::market.eq(key.market.as_str()))
            .filter(bars_dsl::interval.eq(key.interval.as_str()))
            .filter(bars_dsl::open_time.ge(range.start.timestamp_millis()))
            .filter(bars_dsl::open_time.lt(range.end.timestamp_millis()))
            .order(bars_dsl::open_time.asc())
            .select(CacheBarDB::as_select())
            .load(&mut conn)
            .into_core()?;

        let bars = rows
            .into_iter()
            .map(CacheBarDB::into_bar)
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|message| corrupt(key, message))?;
        let series = BarSeries::try_from_ordered(key.clone(), bars)
            .map_err(|violation| corrupt(key, violation.to_string()))?;
        let coverage = load_coverage(&mut conn, key)?.clip(range);

        Ok((series, coverage))
    }

    async fn put(&self, series: &BarSeries, coverage: &Coverage) -> Result<()> {
        let key = series.key.clone();
        let incoming: Vec<CacheBarDB> = series
            .bars()
            .iter()
            .filter(|bar| bar.provenance != SourceKind::Cache)
            .map(|bar| CacheBarDB::from_bar(&key, bar))
            .collect();
        let coverage = coverage.clone();
        let now = self.clock.utc_now();

        let (written, kept) = self
            .writer
            .exec(move |conn: &mut SqliteConnection| -> Result<(usize, usize)> {
                let mut kept = 0;
                let bounds = incoming
                    .first()
                    .zip(incoming.last())
                    .map(|(first, last)| (first.open_time, last.open_time));
                let rows: Vec<CacheBarDB> = match bounds {
                    Some((first, last)) => {
                        let stored: HashMap<i64, String> = bars_dsl::cache_bars
                            .filter(bars_dsl::symbol.eq(&key.symbol))
                            .filter(bars_dsl::market.eq(key.market.as_str()))
                            .filter(bars_dsl::interval.eq(key.interval.as_str()))
                            .filter(bars_dsl::open_time.ge(first))
                            .filter(bars_dsl::open_time.le(last))
                            .select((bars_dsl::open_time, bars_dsl::provenance))
                            .load::<(i64, String)>(conn)
                            .into_core()?
                            .into_iter()
                            .collect();

                        incoming
                            .into_iter()
                            .filter(|row| {
                                let replace = match stored.get(&row.open_time) {
                                    None => true,
                                    Some(existing) => match (
                                        SourceKind::from_str(existing),
                                        SourceKind::from_str(&row.provenance),
                                    ) {
                                        (Ok(existing), Ok(incoming)) => {
                                            should_replace(existing, incoming)
                                        }
                                        // Unreadable rows get overwritten.
                                        _ => true,
                                    },
                                };
                                if !replace {
                                    kept += 1;
                                }
                                replace
                            })
                            .collect()
                    }
                    None => Vec::new(),
                };

                for chunk in chunk_for_insert(&rows, CacheBarDB::COLUMNS) {
                    diesel::replace_into(bars_dsl::cache_bars)
                        .values(chunk)
                        .execute(conn)
                        .into_core()?;
                }

                if !coverage.is_empty() {
                    let mut merged = load_coverage(conn, &key)?;
                    merged.union(&coverage);
                    rewrite_coverage(conn, &key, &merged, now)?;
                }
                Ok((rows.len(), kept))
            })
            .await?;

        debug!(
            "SQLite cache: stored {} bars for {} ({} archive bars kept)",
            written, series.key, kept
        );
        Ok(())
    }

    async fn invalidate(&self, key: &SeriesKey, range: &TimeRange) -> Result<()> {
        let key = key.clone();
        let range = *range;
        let now = self.clock.utc_now();
        let removed = self
            .writer
            .exec(move |conn: &mut SqliteConnection| -> Result<usize> {
                let removed = diesel::delete(
                    bars_dsl::cache_bars
                        .filter(bars_dsl::symbol.eq(&key.symbol))
                        .filter(bars_dsl::market.eq(key.market.as_str()))
                        .filter(bars_dsl::interval.eq(key.interval.as_str()))
                        .filter(bars_dsl::open_time.ge(range.start.timestamp_millis()))
                        .filter(bars_dsl::open_time.lt(range.end.timestamp_millis())),
                )
                .execute(conn)
                .into_core()?;

                // Corrupt coverage rows are dropped along with the range.
                let mut coverage = match load_coverage(conn, &key) {
                    Ok(coverage) => coverage,
                    Err(e) => {
                        warn!("Discarding unreadable coverage for {}: {}", key, e);
                        Coverage::empty()
                    }
                };
                coverage.subtract(&range);
                rewrite_coverage(conn, &key, &coverage, now)?;
                Ok(removed)
            })
            .await?;

        debug!("SQLite cache: invalidated {} bars", removed);
        Ok(())
    }

    async fn stats(&self, key: &SeriesKey) -> Result<CacheStats> {
        let mut conn = get_connection(&self.pool)?;

        let bars: i64 = bars_dsl::cache_bars
            .filter(bars_dsl::symbol.eq(&key.symbol))
            .filter(bars_dsl::market.eq(key.market.as_str()))
            .filter(bars_dsl::interval.eq(key.interval.as_str()))
            .count()
            .get_result(&mut conn)
            .into_core()?;

        let rows = load_coverage_rows(&mut conn, key)?;
        let refreshed_at = rows.iter().filter_map(CoverageRowDB::updated_at).max();
        let ranges = rows
            .iter()
            .map(CoverageRowDB::range)
            .collect::<std::result::Result<Vec<_>, String>>()
            .map_err(|message| corrupt(key, message))?;

        Ok(CacheStats {
            bars: usize::try_from(bars).unwrap_or_default(),
            coverage: Coverage::from_ranges(ranges),
            refreshed_at,
        })
    }
}
