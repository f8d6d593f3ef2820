//! In-process cache store.
//!
//! Keeps everything in a map behind one lock. Used by tests and by callers
//! that do not need the cache to outlive the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use barvault_market_data::{
    Bar, BarSeries, Clock, Coverage, SeriesKey, SourceKind, SystemClock, TimeRange,
};
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::store::{CacheStats, CacheStore};
use crate::errors::Result;

#[derive(Default)]
struct Entry {
    bars: BTreeMap<DateTime<Utc>, Bar>,
    coverage: Coverage,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Merge rule shared by every store: archive data is never overwritten by live
/// data for the same open time.
pub fn should_replace(existing: SourceKind, incoming: SourceKind) -> bool {
    !(existing == SourceKind::Archive && incoming == SourceKind::Live)
}

pub struct MemoryCacheStore {
    entries: Mutex<HashMap<SeriesKey, Entry>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps refreshes with `clock` instead of the system time.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<SeriesKey, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Memory cache mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &SeriesKey, range: &TimeRange) -> Result<(BarSeries, Coverage)> {
        let entries = self.lock_entries();
        let Some(entry) = entries.get(key) else {
            return Ok((BarSeries::new(key.clone()), Coverage::empty()));
        };

        let bars: Vec<Bar> = entry
            .bars
            .range(range.start..range.end)
            .map(|(_, bar)| bar.clone())
            .collect();
        Ok((
            BarSeries::from_bars(key.clone(), bars),
            entry.coverage.clip(range),
        ))
    }

    async fn put(&self, series: &BarSeries, coverage: &Coverage) -> Result<()> {
        let mut entries = self.lock_entries();
        let entry = entries.entry(series.key.clone()).or_default();

        let mut kept = 0;
        for bar in series.bars() {
            match entry.bars.get(&bar.open_time) {
                Some(existing) if !should_replace(existing.provenance, bar.provenance) => {
                    kept += 1;
                }
                _ => {
                    entry.bars.insert(bar.open_time, bar.clone());
                }
            }
        }
        entry.coverage.union(coverage);
        entry.refreshed_at = Some(self.clock.utc_now());

        debug!(
            "Memory cache: stored {} bars for {} ({} archive bars kept)",
            series.len() - kept,
            series.key,
            kept
        );
        Ok(())
    }

    async fn invalidate(&self, key: &SeriesKey, range: &TimeRange) -> Result<()> {
        if let Some(entry) = self.lock_entries().get_mut(key) {
            entry.bars.retain(|open_time, _| !range.contains(*open_time));
            entry.coverage.subtract(range);
        }
        Ok(())
    }

    async fn stats(&self, key: &SeriesKey) -> Result<CacheStats> {
        Ok(self
            .lock_entries()
            .get(key)
            .map(|entry| CacheStats {
                bars: entry.bars.len(),
                coverage: entry.coverage.clone(),
                refreshed_at: entry.refreshed_at,
            })
            .unwrap_or_default())
    }
}
