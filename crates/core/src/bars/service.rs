//! Failover cascade orchestrator.
//!
//! One `get_bars` call walks a fixed sequence of states:
//!
//! ```text
//! Validating -> ResolvingFromCache -> FetchingArchive -> FetchingLive
//!            -> Reconciling -> RepairingGaps -> Done
//! ```
//!
//! and may drop to `Failed` from any of them. The cache answers first; what
//! it does not cover is split at the archive cutoff, older parts going to the
//! archive and newer parts (plus whatever the archive could not deliver) to
//! the live source. Results are merged by tier priority, gaps are repaired
//! with one live fetch each, and everything fetched is written back as one
//! record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use barvault_market_data::models::market;
use barvault_market_data::{
    Bar, BarSeries, BarSource, Clock, Coverage, FetchDiagnostics, FetchRequest, FetchResult,
    Interval, MarketType, PartialFetch, SeriesKey, SkipReason, SourceKind, TimeRange,
};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use super::reindex::{detect_gaps, Gap};
use super::store::CacheStore;
use crate::config::BarsConfig;
use crate::errors::{Error, Result};

/// Diagnostics id for the cache tier.
pub const CACHE_SOURCE_ID: &str = "CACHE";

/// Phases of one request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FetchState {
    Validating,
    ResolvingFromCache,
    FetchingArchive,
    FetchingLive,
    Reconciling,
    RepairingGaps,
    Done,
    Failed,
}

impl fmt::Display for FetchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logs state transitions for one request.
struct StateTrace {
    label: String,
    state: FetchState,
}

impl StateTrace {
    fn new(label: String) -> Self {
        debug!("{}: -> {}", label, FetchState::Validating);
        Self {
            label,
            state: FetchState::Validating,
        }
    }

    fn enter(&mut self, next: FetchState) {
        debug!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!("{}: failed in {}: {}", self.label, self.state, error);
        self.enter(FetchState::Failed);
        error
    }
}

/// One `get_bars` call.
#[derive(Clone, Debug)]
pub struct BarsRequest {
    pub symbol: String,
    pub market: MarketType,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Fail with `IncompleteData` instead of reporting gaps. Defaults to config.
    pub strict: Option<bool>,
    /// Wall time allowed for the whole call. Defaults to config.
    pub deadline: Option<Duration>,
}

impl BarsRequest {
    pub fn new(
        symbol: impl Into<String>,
        market: MarketType,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            market,
            interval,
            start,
            end,
            strict: None,
            deadline: None,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// What happened to the requested range besides the returned bars.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapReport {
    /// The normalized range that was served.
    pub requested: TimeRange,
    /// Gaps left in the returned series.
    pub unresolved: Vec<Gap>,
    /// Gaps closed by a repair fetch.
    pub repaired: Vec<Gap>,
    /// Gaps too large to repair (also listed in `unresolved`).
    pub unrepairable: Vec<Gap>,
    pub diagnostics: FetchDiagnostics,
    /// The deadline cut at least one fetch short.
    pub timed_out: bool,
}

impl GapReport {
    fn new(requested: TimeRange) -> Self {
        Self {
            requested,
            unresolved: Vec::new(),
            repaired: Vec::new(),
            unrepairable: Vec::new(),
            diagnostics: FetchDiagnostics::new(),
            timed_out: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Bars from one tier, in arrival order.
struct Layer {
    tier: SourceKind,
    /// Already stored; never part of the write-back.
    from_cache: bool,
    bars: Vec<Bar>,
}

/// Merged series plus the subset that did not come from the cache.
struct Merged {
    series: BarSeries,
    fetched: Vec<Bar>,
}

/// Merges layers by tier rank; bars opening before `cutoff` are settled.
///
/// Lower rank wins; on equal rank the later layer (or later bar) wins.
fn merge_layers(key: &SeriesKey, cutoff: DateTime<Utc>, layers: &[Layer]) -> Merged {
    let mut winners: BTreeMap<DateTime<Utc>, (u8, bool, &Bar)> = BTreeMap::new();
    for layer in layers {
        for bar in &layer.bars {
            let rank = layer.tier.rank(bar.open_time < cutoff);
            match winners.get(&bar.open_time) {
                Some((held, _, _)) if *held < rank => {}
                _ => {
                    winners.insert(bar.open_time, (rank, layer.from_cache, bar));
                }
            }
        }
    }

    let mut bars = Vec::with_capacity(winners.len());
    let mut fetched = Vec::new();
    for (_, (_, from_cache, bar)) in winners {
        if !from_cache {
            fetched.push(bar.clone());
        }
        bars.push(bar.clone());
    }
    Merged {
        series: BarSeries::from_bars(key.clone(), bars),
        fetched,
    }
}

/// Outcome of a batch of concurrent fetches against one source.
#[derive(Default)]
struct Batch {
    results: Vec<FetchResult>,
    coverage: Coverage,
    diagnostics: FetchDiagnostics,
    timed_out: bool,
}

impl Batch {
    /// Moves attempts and the deadline flag into `report`.
    fn record_into(&mut self, report: &mut GapReport) {
        report
            .diagnostics
            .attempts
            .append(&mut self.diagnostics.attempts);
        report.timed_out |= self.timed_out;
    }
}

/// Retrieves bar series through the cache, archive and live tiers.
pub struct BarService {
    cache: Arc<dyn CacheStore>,
    archive: Arc<dyn BarSource>,
    live: Arc<dyn BarSource>,
    clock: Arc<dyn Clock>,
    config: BarsConfig,
}

impl BarService {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        archive: Arc<dyn BarSource>,
        live: Arc<dyn BarSource>,
        clock: Arc<dyn Clock>,
        config: BarsConfig,
    ) -> Self {
        Self {
            cache,
            archive,
            live,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BarsConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Settled bars open before this instant.
    pub fn archive_cutoff(&self, interval: Interval) -> DateTime<Utc> {
        let lag = chrono::Duration::from_std(self.config.archive_lag)
            .unwrap_or_else(|_| chrono::Duration::zero());
        interval.align(self.clock.utc_now() - lag)
    }

    /// Fetches `[start, end)` for one series.
    ///
    /// Returns the merged series and a report of what could not be filled.
    /// Fails only on precondition violations (including ranges longer than
    /// `max_request_bars`), or on unresolved gaps when the request is strict.
    pub async fn get_bars(&self, request: &BarsRequest) -> Result<(BarSeries, GapReport)> {
        let key = SeriesKey::new(request.symbol.as_str(), request.market, request.interval);
        let mut trace = StateTrace::new(format!("get_bars {}", key));

        market::validate(key.interval, key.market).map_err(|e| trace.fail(e.into()))?;
        if request.start > request.end {
            return Err(trace.fail(Error::InvalidRange(format!(
                "start {} is after end {}",
                request.start, request.end
            ))));
        }

        let interval = key.interval;
        let now = self.clock.utc_now();
        let range = TimeRange::new(
            interval.align(request.start),
            interval.align(request.end).min(interval.align(now)),
        );
        let cutoff = self.archive_cutoff(interval);
        let strict = request.strict.unwrap_or(self.config.strict);
        let deadline = request
            .deadline
            .or(self.config.deadline)
            .map(|d| Instant::now() + d);
        let requested_bars = interval.bars_between(range.start, range.end);
        if requested_bars > self.config.max_request_bars {
            return Err(trace.fail(Error::RangeTooLarge {
                bars: requested_bars,
                limit: self.config.max_request_bars,
            }));
        }
        let mut report = GapReport::new(range);

        if range.is_empty() {
            trace.enter(FetchState::Done);
            return Ok((BarSeries::new(key), report));
        }

        trace.enter(FetchState::ResolvingFromCache);
        let (cached, mut cache_coverage) = self.read_cache(&key, &range, &mut report).await;
        // Live bars that have settled since they were stored go back to the
        // archive; the stored copies only fill in if the archive has nothing.
        let (cached, provisional) = split_provisional(cached, cutoff);
        let provisional_coverage = Coverage::from_ranges(
            provisional
                .iter()
                .map(|b| TimeRange::new(b.open_time, interval.advance(b.open_time, 1))),
        );
        for window in provisional_coverage.ranges() {
            cache_coverage.subtract(window);
        }
        if !provisional.is_empty() {
            debug!(
                "Cache: {} live bars of {} settled since stored; rechecking {} with the archive",
                provisional.len(),
                key,
                provisional_coverage
            );
        }

        trace.enter(FetchState::FetchingArchive);
        let mut archive_ranges = Vec::new();
        let mut recent_ranges = Vec::new();
        for uncovered in cache_coverage.complement(&range) {
            let (settled, recent) = uncovered.split_at(cutoff);
            if !settled.is_empty() {
                archive_ranges.push(settled);
            }
            if !recent.is_empty() {
                report.diagnostics.record_skip(
                    self.archive.id().into(),
                    recent,
                    SkipReason::NewerThanCutoff,
                );
                recent_ranges.push(recent);
            }
        }

        // Recent ranges never touch the archive, so they go out alongside it.
        let (mut archive, mut recent) = futures::join!(
            self.fetch_batch(self.archive.as_ref(), &key, archive_ranges.clone(), deadline),
            self.fetch_batch(self.live.as_ref(), &key, recent_ranges, deadline),
        );
        archive.record_into(&mut report);
        recent.record_into(&mut report);

        trace.enter(FetchState::FetchingLive);
        // Whatever the archive did not deliver falls through to live, except
        // settled live bars the cache already holds.
        let fallthrough: Vec<TimeRange> = archive_ranges
            .iter()
            .flat_map(|requested| archive.coverage.complement(requested))
            .flat_map(|missing| provisional_coverage.complement(&missing))
            .collect();
        let mut fallback = self
            .fetch_batch(self.live.as_ref(), &key, fallthrough, deadline)
            .await;
        fallback.record_into(&mut report);

        trace.enter(FetchState::Reconciling);
        let mut layers = vec![
            Layer {
                tier: SourceKind::Cache,
                from_cache: true,
                bars: cached,
            },
            Layer {
                tier: SourceKind::Live,
                from_cache: true,
                bars: provisional,
            },
        ];
        let mut written = archive.coverage.clone();
        written.union(&recent.coverage);
        written.union(&fallback.coverage);
        layers.extend(into_layers(SourceKind::Archive, archive.results));
        layers.extend(into_layers(SourceKind::Live, recent.results));
        layers.extend(into_layers(SourceKind::Live, fallback.results));
        let merged = merge_layers(&key, cutoff, &layers);

        trace.enter(FetchState::RepairingGaps);
        let gaps = detect_gaps(&merged.series, &range);
        let mut repair_gaps = Vec::new();
        for gap in gaps {
            let window = gap.window(interval);
            if cache_coverage.covers(&window) {
                report.diagnostics.record_skip(
                    self.live.id().into(),
                    window,
                    SkipReason::ServedFromCache,
                );
            } else if gap.missing_bars > self.config.max_repair_bars {
                report.diagnostics.record_skip(
                    self.live.id().into(),
                    window,
                    SkipReason::GapTooLarge {
                        bars: gap.missing_bars,
                        threshold: self.config.max_repair_bars,
                    },
                );
                report.unrepairable.push(gap);
            } else {
                repair_gaps.push(gap);
            }
        }

        let merged = if repair_gaps.is_empty() {
            merged
        } else {
            let windows: Vec<TimeRange> = repair_gaps.iter().map(|g| g.window(interval)).collect();
            let mut repairs = self
                .fetch_batch(self.live.as_ref(), &key, windows, deadline)
                .await;
            repairs.record_into(&mut report);
            written.union(&repairs.coverage);
            layers.extend(into_layers(SourceKind::Live, repairs.results));
            merge_layers(&key, cutoff, &layers)
        };

        report.unresolved = detect_gaps(&merged.series, &range);
        report.repaired = repair_gaps
            .into_iter()
            .filter(|gap| {
                let window = gap.window(interval);
                !report
                    .unresolved
                    .iter()
                    .any(|left| left.window(interval).overlaps(&window))
            })
            .collect();

        self.write_back(&key, merged.fetched, &written, &mut report)
            .await;

        info!(
            "{} {}: {} bars, {} unresolved gaps; {}",
            key,
            range,
            merged.series.len(),
            report.unresolved.len(),
            report.diagnostics.summary()
        );

        if strict && !report.unresolved.is_empty() {
            return Err(trace.fail(Error::IncompleteData {
                gaps: report.unresolved,
            }));
        }

        trace.enter(FetchState::Done);
        Ok((merged.series, report))
    }

    /// Reads the cache; trouble there degrades to a miss.
    async fn read_cache(
        &self,
        key: &SeriesKey,
        range: &TimeRange,
        report: &mut GapReport,
    ) -> (BarSeries, Coverage) {
        match self.cache.get(key, range).await {
            Ok((series, coverage)) => {
                if !coverage.is_empty() {
                    report
                        .diagnostics
                        .record_success(CACHE_SOURCE_ID.into(), *range, series.len());
                }
                (series.slice(range), coverage.clip(range))
            }
            Err(error @ Error::CorruptCacheRecord { .. }) => {
                warn!("Cache: {}; invalidating {} and refetching", error, range);
                report
                    .diagnostics
                    .record_error(CACHE_SOURCE_ID.into(), *range, error.to_string(), 0);
                if let Err(e) = self.cache.invalidate(key, range).await {
                    warn!("Cache: failed to invalidate {} {}: {}", key, range, e);
                }
                (BarSeries::new(key.clone()), Coverage::empty())
            }
            Err(error) => {
                warn!("Cache: read of {} {} failed: {}", key, range, error);
                report
                    .diagnostics
                    .record_error(CACHE_SOURCE_ID.into(), *range, error.to_string(), 0);
                (BarSeries::new(key.clone()), Coverage::empty())
            }
        }
    }

    /// Fetches every range from `source` concurrently.
    ///
    /// Ranges still in flight when the deadline passes are dropped and
    /// recorded as skipped; pages or files they had already finished are
    /// kept.
    async fn fetch_batch(
        &self,
        source: &dyn BarSource,
        key: &SeriesKey,
        ranges: Vec<TimeRange>,
        deadline: Option<Instant>,
    ) -> Batch {
        let mut batch = Batch::default();
        if ranges.is_empty() {
            return batch;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            batch.timed_out = true;
            for range in ranges {
                batch
                    .diagnostics
                    .record_skip(source.id().into(), range, SkipReason::DeadlineExceeded);
            }
            return batch;
        }

        let mut outstanding: Vec<(TimeRange, Arc<PartialFetch>)> = ranges
            .into_iter()
            .map(|range| (range, Arc::new(PartialFetch::new())))
            .collect();
        let mut in_flight: FuturesUnordered<_> = outstanding
            .iter()
            .map(|(range, progress)| {
                let range = *range;
                let request = FetchRequest::new(key.clone(), range).with_progress(progress.clone());
                async move {
                    let result = source.fetch(&request).await;
                    (range, result)
                }
            })
            .collect();

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        batch.timed_out = true;
                        break;
                    }
                },
                None => in_flight.next().await,
            };
            let Some((range, result)) = next else {
                break;
            };

            outstanding.retain(|(r, _)| *r != range);
            match &result.failure {
                Some(error) => {
                    warn!("{}: {} {} failed: {}", source.id(), key, range, error);
                    batch.diagnostics.record_error(
                        source.id().into(),
                        range,
                        error.to_string(),
                        result.series.len(),
                    );
                }
                None => batch.diagnostics.record_success(
                    source.id().into(),
                    range,
                    result.series.len(),
                ),
            }
            batch.coverage.union(&result.coverage.clip(&range));
            batch.results.push(result);
        }
        drop(in_flight);

        for (range, progress) in outstanding {
            let partial = progress.take(key.clone());
            warn!(
                "{}: {} {} abandoned at deadline with {} bars over {}",
                source.id(),
                key,
                range,
                partial.series.len(),
                partial.coverage
            );
            batch
                .diagnostics
                .record_skip(source.id().into(), range, SkipReason::DeadlineExceeded);
            if !partial.coverage.is_empty() {
                batch.coverage.union(&partial.coverage.clip(&range));
                batch.results.push(partial);
            }
        }
        batch
    }

    /// Stores fetched bars and their coverage as one record.
    async fn write_back(
        &self,
        key: &SeriesKey,
        fetched: Vec<Bar>,
        coverage: &Coverage,
        report: &mut GapReport,
    ) {
        if fetched.is_empty() && coverage.is_empty() {
            return;
        }
        let series = BarSeries::from_bars(key.clone(), fetched);
        let bars = series.len();
        match self.cache.put(&series, coverage).await {
            Ok(()) => debug!("Cache: wrote {} bars for {} over {}", bars, key, coverage),
            Err(error) => {
                warn!("Cache: write-back for {} failed: {}", key, error);
                report.diagnostics.record_error(
                    CACHE_SOURCE_ID.into(),
                    report.requested,
                    format!("write-back failed: {}", error),
                    bars,
                );
            }
        }
    }
}

fn into_layers(tier: SourceKind, results: Vec<FetchResult>) -> impl Iterator<Item = Layer> {
    results.into_iter().map(move |result| Layer {
        tier,
        from_cache: false,
        bars: result.series.into_bars(),
    })
}

/// Splits cached bars into final ones and live ones that have settled since.
///
/// Bars at or after `cutoff` stay with the first group; the cache is still
/// authoritative for them.
fn split_provisional(cached: BarSeries, cutoff: DateTime<Utc>) -> (Vec<Bar>, Vec<Bar>) {
    cached
        .into_bars()
        .into_iter()
        .partition(|bar| !(bar.provenance == SourceKind::Live && bar.open_time < cutoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", MarketType::Spot, Interval::Hour1)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn bar(open_time: DateTime<Utc>, close: Decimal, provenance: SourceKind) -> Bar {
        Bar {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            trade_count: None,
            provenance,
        }
    }

    fn layer(tier: SourceKind, bars: Vec<Bar>) -> Layer {
        Layer {
            tier,
            from_cache: tier == SourceKind::Cache,
            bars,
        }
    }

    #[test]
    fn test_archive_beats_live_once_settled() {
        let cutoff = now() - chrono::Duration::hours(48);
        let settled = now() - chrono::Duration::hours(50);
        let recent = now() - chrono::Duration::hours(1);

        // Live arrives last and would win a plain last-write-wins merge.
        let layers = vec![
            layer(
                SourceKind::Archive,
                vec![
                    bar(settled, dec!(100), SourceKind::Archive),
                    bar(recent, dec!(100), SourceKind::Archive),
                ],
            ),
            layer(
                SourceKind::Live,
                vec![
                    bar(settled, dec!(101), SourceKind::Live),
                    bar(recent, dec!(101), SourceKind::Live),
                ],
            ),
        ];

        let merged = merge_layers(&key(), cutoff, &layers);
        let closes: Vec<_> = merged.series.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(100), dec!(101)]);
    }

    #[test]
    fn test_cache_wins_settled_and_is_not_rewritten() {
        let cutoff = now() - chrono::Duration::hours(48);
        let settled = now() - chrono::Duration::hours(72);
        let layers = vec![
            layer(SourceKind::Cache, vec![bar(settled, dec!(7), SourceKind::Archive)]),
            layer(SourceKind::Archive, vec![bar(settled, dec!(8), SourceKind::Archive)]),
        ];

        let merged = merge_layers(&key(), cutoff, &layers);
        assert_eq!(merged.series.bars()[0].close, dec!(7));
        assert!(merged.fetched.is_empty());
    }

    #[test]
    fn test_same_tier_tie_goes_to_later_result() {
        let cutoff = now();
        let open = now() - chrono::Duration::hours(3);
        let layers = vec![
            layer(SourceKind::Live, vec![bar(open, dec!(1), SourceKind::Live)]),
            layer(SourceKind::Live, vec![bar(open, dec!(2), SourceKind::Live)]),
        ];

        let merged = merge_layers(&key(), cutoff, &layers);
        assert_eq!(merged.series.bars()[0].close, dec!(2));
        assert_eq!(merged.fetched.len(), 1);
    }

    #[test]
    fn test_only_settled_live_bars_are_provisional() {
        let cutoff = now() - chrono::Duration::hours(48);
        let cached = BarSeries::from_bars(
            key(),
            vec![
                bar(cutoff - chrono::Duration::hours(2), dec!(1), SourceKind::Archive),
                bar(cutoff - chrono::Duration::hours(1), dec!(1), SourceKind::Live),
                bar(cutoff, dec!(1), SourceKind::Live),
            ],
        );

        let (kept, provisional) = split_provisional(cached, cutoff);

        assert_eq!(kept.len(), 2);
        assert_eq!(provisional.len(), 1);
        assert_eq!(provisional[0].open_time, cutoff - chrono::Duration::hours(1));
    }

    #[test]
    fn test_cached_fallback_layer_loses_to_archive_and_is_not_rewritten() {
        let cutoff = now() - chrono::Duration::hours(48);
        let settled = now() - chrono::Duration::hours(60);
        let other = settled + chrono::Duration::hours(1);
        let layers = vec![
            Layer {
                tier: SourceKind::Live,
                from_cache: true,
                bars: vec![
                    bar(settled, dec!(1), SourceKind::Live),
                    bar(other, dec!(1), SourceKind::Live),
                ],
            },
            layer(SourceKind::Archive, vec![bar(settled, dec!(2), SourceKind::Archive)]),
        ];

        let merged = merge_layers(&key(), cutoff, &layers);

        let closes: Vec<_> = merged.series.bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![dec!(2), dec!(1)]);
        assert_eq!(merged.fetched.len(), 1);
        assert_eq!(merged.fetched[0].provenance, SourceKind::Archive);
    }
}
