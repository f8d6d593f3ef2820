//! Tests for the BarService cascade.
//!
//! # Critical Contract Points
//!
//! 1. Validation: unsupported (interval, market) pairs fail before any I/O
//! 2. Cascade: cache first, archive for settled ranges, live for recent ones
//!    and for whatever the archive could not deliver
//! 3. Idempotence: a fully cached range costs zero source calls
//! 4. Repair: gaps are re-fetched once from live, bounded by size
//! 5. Strict mode: unresolved gaps fail the call, otherwise they are reported
//! 6. Deadline: pending fetches are abandoned and surface as gaps, keeping
//!    the pages and files they had finished
//! 7. Settling: cached live bars older than the cutoff are rechecked against
//!    the archive

#[cfg(test)]
mod tests {
    use crate::bars::{BarService, BarsRequest, CacheStats, CacheStore, Gap, MemoryCacheStore};
    use crate::config::BarsConfig;
    use crate::errors::{Error, Result};
    use async_trait::async_trait;
    use barvault_market_data::{
        ArchivePeriod, ArchiveTransport, Bar, BarSeries, BarSource, BulkArchiveClient, Coverage,
        FetchRequest, FetchResult, Interval, LimiterMode, LiveQueryClient, LiveTransport,
        ManualClock, MarketDataError, MarketType, PageQuery, RateLimiter, SeriesKey, SkipReason,
        SourceKind, TimeRange, WeightBudget,
    };
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    // =========================================================================
    // Fixtures
    // =========================================================================

    /// 2024-03-10 12:00 UTC; with the default 48h lag the cutoff is
    /// 2024-03-08 12:00.
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    fn bar(open_time: DateTime<Utc>, close: Decimal, provenance: SourceKind) -> Bar {
        Bar {
            open_time,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(12.5),
            trade_count: Some(3),
            provenance,
        }
    }

    fn opens(interval: Interval, range: &TimeRange) -> Vec<DateTime<Utc>> {
        let mut opens = Vec::new();
        let mut open = interval.align_up(range.start);
        while open < range.end {
            opens.push(open);
            open = interval.advance(open, 1);
        }
        opens
    }

    // =========================================================================
    // Mock sources
    // =========================================================================

    /// Serves one bar per expected open, except for holes. Failing ranges are
    /// left out of both bars and coverage, and the result carries a failure.
    struct ScriptedSource {
        id: &'static str,
        kind: SourceKind,
        close: Decimal,
        holes: Vec<DateTime<Utc>>,
        failing: Vec<TimeRange>,
        calls: AtomicUsize,
        requests: Mutex<Vec<TimeRange>>,
    }

    impl ScriptedSource {
        fn new(id: &'static str, kind: SourceKind, close: Decimal) -> Self {
            Self {
                id,
                kind,
                close,
                holes: Vec::new(),
                failing: Vec::new(),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn archive() -> Self {
            Self::new("VISION", SourceKind::Archive, dec!(100))
        }

        fn live() -> Self {
            Self::new("REST", SourceKind::Live, dec!(200))
        }

        fn with_holes(mut self, holes: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
            self.holes.extend(holes);
            self
        }

        fn failing_on(mut self, range: TimeRange) -> Self {
            self.failing.push(range);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<TimeRange> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BarSource for ScriptedSource {
        fn id(&self) -> &'static str {
            self.id
        }

        fn kind(&self) -> SourceKind {
            self.kind
        }

        async fn fetch(&self, request: &FetchRequest) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.range);

            let mut coverage = Coverage::from_range(request.range);
            let mut failed = false;
            for outage in self.failing.iter().filter(|f| f.overlaps(&request.range)) {
                coverage.subtract(outage);
                failed = true;
            }
            let bars = opens(request.key.interval, &request.range)
                .into_iter()
                .filter(|open| !self.holes.contains(open))
                .filter(|open| !self.failing.iter().any(|f| f.contains(*open)))
                .map(|open| bar(open, self.close, self.kind))
                .collect();

            FetchResult {
                series: BarSeries::from_bars(request.key.clone(), bars),
                coverage,
                failure: failed.then(|| MarketDataError::ProviderUnavailable {
                    provider: self.id.to_string(),
                    message: "scripted outage".to_string(),
                }),
            }
        }
    }

    /// Never answers.
    struct HangingSource;

    #[async_trait]
    impl BarSource for HangingSource {
        fn id(&self) -> &'static str {
            "VISION"
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Archive
        }

        async fn fetch(&self, _request: &FetchRequest) -> FetchResult {
            futures::future::pending::<FetchResult>().await
        }
    }

    // =========================================================================
    // Mock CacheStore
    // =========================================================================

    /// Memory store with counters and injectable faults.
    #[derive(Default)]
    struct InstrumentedCache {
        inner: MemoryCacheStore,
        gets: AtomicUsize,
        corrupt_reads: AtomicUsize,
        fail_puts: bool,
        invalidations: Mutex<Vec<TimeRange>>,
    }

    impl InstrumentedCache {
        fn corrupt_once() -> Self {
            let cache = Self::default();
            cache.corrupt_reads.store(1, Ordering::SeqCst);
            cache
        }

        fn failing_puts() -> Self {
            Self {
                fail_puts: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CacheStore for InstrumentedCache {
        async fn get(&self, key: &SeriesKey, range: &TimeRange) -> Result<(BarSeries, Coverage)> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let corrupt = self
                .corrupt_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if corrupt {
                return Err(Error::CorruptCacheRecord {
                    key: key.to_string(),
                    message: "duplicate open time".to_string(),
                });
            }
            self.inner.get(key, range).await
        }

        async fn put(&self, series: &BarSeries, coverage: &Coverage) -> Result<()> {
            if self.fail_puts {
                return Err(Error::Unexpected("Intentional put failure".into()));
            }
            self.inner.put(series, coverage).await
        }

        async fn invalidate(&self, key: &SeriesKey, range: &TimeRange) -> Result<()> {
            self.invalidations.lock().unwrap().push(*range);
            self.inner.invalidate(key, range).await
        }

        async fn stats(&self, key: &SeriesKey) -> Result<CacheStats> {
            self.inner.stats(key).await
        }
    }

    // =========================================================================
    // Service setup
    // =========================================================================

    struct Harness {
        service: BarService,
        cache: Arc<InstrumentedCache>,
        archive: Arc<ScriptedSource>,
        live: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
    }

    fn harness_with(
        cache: InstrumentedCache,
        archive: ScriptedSource,
        live: ScriptedSource,
        config: BarsConfig,
    ) -> Harness {
        let cache = Arc::new(cache);
        let archive = Arc::new(archive);
        let live = Arc::new(live);
        let clock = Arc::new(ManualClock::new(now()));
        let service = BarService::new(
            cache.clone(),
            archive.clone(),
            live.clone(),
            clock.clone(),
            config,
        );
        Harness {
            service,
            cache,
            archive,
            live,
            clock,
        }
    }

    fn harness(archive: ScriptedSource, live: ScriptedSource) -> Harness {
        harness_with(
            InstrumentedCache::default(),
            archive,
            live,
            BarsConfig::default(),
        )
    }

    fn minute_request(start: DateTime<Utc>, end: DateTime<Utc>) -> BarsRequest {
        BarsRequest::new("BTCUSDT", MarketType::Spot, Interval::Minute1, start, end)
    }

    fn hour_request(start: DateTime<Utc>, end: DateTime<Utc>) -> BarsRequest {
        BarsRequest::new("BTCUSDT", MarketType::Spot, Interval::Hour1, start, end)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[tokio::test]
    async fn test_unsupported_interval_fails_before_any_io() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let request = BarsRequest::new(
            "BTCUSDT",
            MarketType::UsdMargined,
            Interval::Second1,
            day(1),
            day(2),
        );

        let err = h.service.get_bars(&request).await.unwrap_err();

        assert!(matches!(
            err,
            Error::UnsupportedInterval {
                interval: Interval::Second1,
                market: MarketType::UsdMargined,
            }
        ));
        assert_eq!(h.cache.gets.load(Ordering::SeqCst), 0);
        assert_eq!(h.archive.calls(), 0);
        assert_eq!(h.live.calls(), 0);
    }

    #[tokio::test]
    async fn test_inverted_range_is_rejected() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let err = h
            .service
            .get_bars(&minute_request(day(2), day(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
        assert_eq!(h.cache.gets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_range_fails_before_any_io() {
        let h = harness_with(
            InstrumentedCache::default(),
            ScriptedSource::archive(),
            ScriptedSource::live(),
            BarsConfig {
                max_request_bars: 100,
                ..BarsConfig::default()
            },
        );

        let err = h
            .service
            .get_bars(&minute_request(day(1), day(1) + Duration::hours(2)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::RangeTooLarge {
                bars: 120,
                limit: 100
            }
        ));
        assert_eq!(h.cache.gets.load(Ordering::SeqCst), 0);
        assert_eq!(h.archive.calls() + h.live.calls(), 0);

        // Exactly at the limit is fine.
        let (series, _) = h
            .service
            .get_bars(&minute_request(day(1), day(1) + Duration::minutes(100)))
            .await
            .unwrap();
        assert_eq!(series.len(), 100);
    }

    #[tokio::test]
    async fn test_future_range_is_empty_without_calls() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let (series, report) = h
            .service
            .get_bars(&minute_request(now() + Duration::hours(1), now() + Duration::hours(2)))
            .await
            .unwrap();
        assert!(series.is_empty());
        assert!(report.is_complete());
        assert_eq!(h.archive.calls() + h.live.calls(), 0);
    }

    // =========================================================================
    // Cascade
    // =========================================================================

    #[tokio::test]
    async fn test_one_hour_of_minutes_from_the_archive() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let start = day(1);
        let end = start + Duration::hours(1);

        let (series, report) = h
            .service
            .get_bars(&minute_request(start, end))
            .await
            .unwrap();

        assert_eq!(series.len(), 60);
        let expected: Vec<_> = (0..60).map(|m| start + Duration::minutes(m)).collect();
        let actual: Vec<_> = series.bars().iter().map(|b| b.open_time).collect();
        assert_eq!(actual, expected);
        assert!(report.is_complete());
        assert_eq!(h.archive.requests(), vec![TimeRange::new(start, end)]);
        assert_eq!(h.live.calls(), 0);
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        // Straddles the cutoff, so both archive and live are used once.
        let request = hour_request(day(7), now());

        let (first, _) = h.service.get_bars(&request).await.unwrap();
        let archive_calls = h.archive.calls();
        let live_calls = h.live.calls();
        assert!(archive_calls > 0 && live_calls > 0);

        let (second, report) = h.service.get_bars(&request).await.unwrap();

        assert_eq!(h.archive.calls(), archive_calls);
        assert_eq!(h.live.calls(), live_calls);
        assert_eq!(report.diagnostics.calls_to("VISION"), 0);
        assert_eq!(report.diagnostics.calls_to("REST"), 0);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_straddling_range_splits_at_cutoff() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let cutoff = now() - Duration::hours(48);

        let (series, report) = h
            .service
            .get_bars(&hour_request(day(7), now()))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(series.len(), 24 * 3 + 12);
        assert_eq!(h.archive.requests(), vec![TimeRange::new(day(7), cutoff)]);
        assert_eq!(h.live.requests(), vec![TimeRange::new(cutoff, now())]);
        for bar in series.bars() {
            let expected = if bar.open_time < cutoff {
                SourceKind::Archive
            } else {
                SourceKind::Live
            };
            assert_eq!(bar.provenance, expected, "at {}", bar.open_time);
        }
    }

    #[tokio::test]
    async fn test_archive_failure_falls_through_to_live() {
        let h = harness(
            ScriptedSource::archive().failing_on(TimeRange::new(day(2), day(3))),
            ScriptedSource::live(),
        );

        let (series, report) = h
            .service
            .get_bars(&hour_request(day(1), day(4)))
            .await
            .unwrap();

        assert!(report.is_complete());
        assert_eq!(series.len(), 72);
        assert_eq!(h.live.requests(), vec![TimeRange::new(day(2), day(3))]);
        for bar in series.bars() {
            let expected = if TimeRange::new(day(2), day(3)).contains(bar.open_time) {
                SourceKind::Live
            } else {
                SourceKind::Archive
            };
            assert_eq!(bar.provenance, expected, "at {}", bar.open_time);
        }
        assert_eq!(report.diagnostics.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_cascade_with_real_clients() {
        struct FileArchive {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl ArchiveTransport for FileArchive {
            async fn fetch_file(
                &self,
                key: &SeriesKey,
                period: &ArchivePeriod,
            ) -> std::result::Result<Option<Vec<Bar>>, MarketDataError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(
                    opens(key.interval, &period.range())
                        .into_iter()
                        .map(|open| bar(open, dec!(100), SourceKind::Archive))
                        .collect(),
                ))
            }
        }

        struct EchoLive {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LiveTransport for EchoLive {
            async fn query(
                &self,
                page: &PageQuery,
            ) -> std::result::Result<Vec<Bar>, MarketDataError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let range = TimeRange::new(page.start, page.end);
                Ok(opens(page.key.interval, &range)
                    .into_iter()
                    .map(|open| bar(open, dec!(200), SourceKind::Live))
                    .collect())
            }
        }

        let clock = Arc::new(ManualClock::new(now()));
        let files = Arc::new(FileArchive {
            calls: AtomicUsize::new(0),
        });
        let pages = Arc::new(EchoLive {
            calls: AtomicUsize::new(0),
        });
        let archive = BulkArchiveClient::new(files.clone(), clock.clone());
        let live = LiveQueryClient::new(pages.clone(), Arc::new(RateLimiter::new(clock.clone())));
        let service = BarService::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(archive),
            Arc::new(live),
            clock,
            BarsConfig::default(),
        );

        let start = now() - Duration::days(4);
        let (series, report) = service.get_bars(&hour_request(start, now())).await.unwrap();

        assert!(report.is_complete(), "{:?}", report.unresolved);
        assert_eq!(series.len(), 96);
        // Mar 6 (clipped) and Mar 7; Mar 8 is not fully published yet.
        assert_eq!(files.calls.load(Ordering::SeqCst), 2);
        // Mar 8 00:00-12:00 falls through, Mar 8 12:00 onwards is recent.
        assert_eq!(pages.calls.load(Ordering::SeqCst), 2);
        let archived = series
            .bars()
            .iter()
            .filter(|b| b.provenance == SourceKind::Archive)
            .count();
        assert_eq!(archived, 36);
    }

    // =========================================================================
    // Settling
    // =========================================================================

    #[tokio::test]
    async fn test_settled_live_bars_are_replaced_by_the_archive() {
        let h = harness(ScriptedSource::archive(), ScriptedSource::live());
        let range = TimeRange::new(now() - Duration::hours(6), now());
        let request = hour_request(range.start, range.end);

        let (first, _) = h.service.get_bars(&request).await.unwrap();
        assert!(first.bars().iter().all(|b| b.provenance == SourceKind::Live));
        assert_eq!(h.archive.calls(), 0);

        // Four days later the whole range is older than the cutoff.
        h.clock.advance(std::time::Duration::from_secs(4 * 24 * 3_600));
        let (second, report) = h.service.get_bars(&request).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(h.archive.requests(), vec![range]);
        assert_eq!(h.live.calls(), 1);
        assert_eq!(second.len(), 6);
        assert!(second
            .bars()
            .iter()
            .all(|b| b.provenance == SourceKind::Archive && b.close == dec!(100)));

        let (stored, _) = h.cache.get(&second.key, &range).await.unwrap();
        assert!(stored
            .bars()
            .iter()
            .all(|b| b.provenance == SourceKind::Archive));

        // Once upgraded, the range is final and costs nothing.
        h.service.get_bars(&request).await.unwrap();
        assert_eq!(h.archive.calls(), 1);
        assert_eq!(h.live.calls(), 1);
    }

    #[tokio::test]
    async fn test_settled_live_bars_stay_when_the_archive_has_nothing() {
        let range = TimeRange::new(now() - Duration::hours(6), now());
        let h = harness(
            ScriptedSource::archive().failing_on(range),
            ScriptedSource::live(),
        );
        let request = hour_request(range.start, range.end);
        h.service.get_bars(&request).await.unwrap();

        h.clock.advance(std::time::Duration::from_secs(4 * 24 * 3_600));
        let (series, report) = h.service.get_bars(&request).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(series.len(), 6);
        assert!(series.bars().iter().all(|b| b.provenance == SourceKind::Live));
        assert_eq!(h.archive.calls(), 1);
        // The stored live bars are not fetched again from live.
        assert_eq!(h.live.calls(), 1);
    }

    // =========================================================================
    // Gap repair
    // =========================================================================

    #[tokio::test]
    async fn test_gap_is_repaired_with_one_scoped_live_fetch() {
        let start = day(1);
        let t = |m: i64| start + Duration::minutes(m);
        let h = harness(
            ScriptedSource::archive().with_holes([t(2), t(3)]),
            ScriptedSource::live(),
        );

        let (series, report) = h
            .service
            .get_bars(&minute_request(start, t(6)))
            .await
            .unwrap();

        assert_eq!(series.len(), 6);
        assert!(report.unresolved.is_empty());
        assert_eq!(
            report.repaired,
            vec![Gap {
                start: t(2),
                end: t(3),
                missing_bars: 2,
            }]
        );
        assert_eq!(h.live.requests(), vec![TimeRange::new(t(2), t(4))]);
        assert_eq!(series.bars()[2].provenance, SourceKind::Live);
        assert_eq!(series.bars()[1].provenance, SourceKind::Archive);
    }

    #[tokio::test]
    async fn test_oversized_gap_is_reported_not_repaired() {
        let start = day(1);
        let holes: Vec<_> = (10..40).map(|m| start + Duration::minutes(m)).collect();
        let config = BarsConfig {
            max_repair_bars: 10,
            ..BarsConfig::default()
        };
        let h = harness_with(
            InstrumentedCache::default(),
            ScriptedSource::archive().with_holes(holes),
            ScriptedSource::live(),
            config,
        );

        let (series, report) = h
            .service
            .get_bars(&minute_request(start, start + Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(series.len(), 30);
        assert_eq!(h.live.calls(), 0);
        assert_eq!(report.unrepairable.len(), 1);
        assert_eq!(report.unrepairable[0].missing_bars, 30);
        assert_eq!(report.unresolved, report.unrepairable);
        assert!(report.diagnostics.attempts.iter().any(|a| matches!(
            a.skipped,
            Some(SkipReason::GapTooLarge {
                bars: 30,
                threshold: 10
            })
        )));
    }

    #[tokio::test]
    async fn test_holes_in_cached_ranges_are_not_refetched() {
        let start = day(1);
        let hole = start + Duration::minutes(5);
        let h = harness(
            ScriptedSource::archive().with_holes([hole]),
            ScriptedSource::live().with_holes([hole]),
        );
        let request = minute_request(start, start + Duration::minutes(10));

        let (_, first) = h.service.get_bars(&request).await.unwrap();
        assert_eq!(first.unresolved.len(), 1);
        assert_eq!(h.live.calls(), 1);

        let (series, second) = h.service.get_bars(&request).await.unwrap();
        assert_eq!(series.len(), 9);
        assert_eq!(second.unresolved, first.unresolved);
        assert_eq!(h.archive.calls(), 1);
        assert_eq!(h.live.calls(), 1);
        assert!(second
            .diagnostics
            .attempts
            .iter()
            .any(|a| matches!(a.skipped, Some(SkipReason::ServedFromCache))));
    }

    // =========================================================================
    // Strict mode
    // =========================================================================

    fn outage_harness() -> Harness {
        let outage = TimeRange::new(day(2), day(3));
        harness(
            ScriptedSource::archive().failing_on(outage),
            ScriptedSource::live().failing_on(outage),
        )
    }

    fn outage_gap() -> Gap {
        Gap {
            start: day(2),
            end: day(2) + Duration::hours(23),
            missing_bars: 24,
        }
    }

    #[tokio::test]
    async fn test_strict_mode_fails_with_exactly_the_failed_subrange() {
        let h = outage_harness();

        let err = h
            .service
            .get_bars(&hour_request(day(1), day(4)).strict(true))
            .await
            .unwrap_err();

        match err {
            Error::IncompleteData { gaps } => assert_eq!(gaps, vec![outage_gap()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_strict_mode_reports_the_same_gap() {
        let h = outage_harness();

        let (series, report) = h
            .service
            .get_bars(&hour_request(day(1), day(4)).strict(false))
            .await
            .unwrap();

        assert_eq!(series.len(), 48);
        assert_eq!(report.unresolved, vec![outage_gap()]);
        // Initial fall-through plus one repair attempt.
        assert_eq!(h.live.calls(), 2);
        // The failed day is not marked as cached.
        let stats = h.cache.stats(&series.key).await.unwrap();
        assert_eq!(
            stats.coverage.ranges(),
            &[TimeRange::new(day(1), day(2)), TimeRange::new(day(3), day(4))]
        );
    }

    #[tokio::test]
    async fn test_strict_default_comes_from_config() {
        let outage = TimeRange::new(day(2), day(3));
        let h = harness_with(
            InstrumentedCache::default(),
            ScriptedSource::archive().failing_on(outage),
            ScriptedSource::live().failing_on(outage),
            BarsConfig {
                strict: true,
                ..BarsConfig::default()
            },
        );
        let result = h.service.get_bars(&hour_request(day(1), day(4))).await;
        assert!(matches!(result, Err(Error::IncompleteData { .. })));
    }

    // =========================================================================
    // Rate limiting
    // =========================================================================

    #[tokio::test]
    async fn test_fail_fast_budget_surfaces_as_gap() {
        struct EchoLive;

        #[async_trait]
        impl LiveTransport for EchoLive {
            async fn query(
                &self,
                page: &PageQuery,
            ) -> std::result::Result<Vec<Bar>, MarketDataError> {
                let range = TimeRange::new(page.start, page.end);
                Ok(opens(page.key.interval, &range)
                    .into_iter()
                    .map(|open| bar(open, dec!(200), SourceKind::Live))
                    .collect())
            }
        }

        let clock = Arc::new(ManualClock::new(now()));
        let limiter = Arc::new(RateLimiter::with_mode(clock.clone(), LimiterMode::FailFast));
        // One spot page per window.
        limiter.configure(MarketType::Spot, WeightBudget::per_minute(2));
        let live = LiveQueryClient::new(Arc::new(EchoLive), limiter).with_page_size(10);
        let service = BarService::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(ScriptedSource::archive()),
            Arc::new(live),
            clock,
            BarsConfig::default(),
        );

        let (series, report) = service
            .get_bars(&minute_request(now() - Duration::minutes(30), now()))
            .await
            .unwrap();

        assert_eq!(series.len(), 10);
        assert_eq!(report.unresolved.len(), 1);
        assert_eq!(report.unresolved[0].missing_bars, 20);
        let errors = report.diagnostics.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|(_, message)| message.contains("Rate limit exceeded")));
    }

    // =========================================================================
    // Cache faults
    // =========================================================================

    #[tokio::test]
    async fn test_corrupt_cache_record_is_invalidated_and_refetched() {
        let h = harness_with(
            InstrumentedCache::corrupt_once(),
            ScriptedSource::archive(),
            ScriptedSource::live(),
            BarsConfig::default(),
        );
        let range = TimeRange::new(day(1), day(2));

        let (series, report) = h
            .service
            .get_bars(&hour_request(range.start, range.end))
            .await
            .unwrap();

        assert_eq!(series.len(), 24);
        assert!(report.is_complete());
        assert_eq!(*h.cache.invalidations.lock().unwrap(), vec![range]);
        assert_eq!(h.archive.calls(), 1);
        assert!(report
            .diagnostics
            .errors()
            .iter()
            .any(|(id, message)| **id == "CACHE" && message.contains("Corrupt")));
    }

    #[tokio::test]
    async fn test_write_back_failure_does_not_fail_the_request() {
        let h = harness_with(
            InstrumentedCache::failing_puts(),
            ScriptedSource::archive(),
            ScriptedSource::live(),
            BarsConfig::default(),
        );

        let (series, report) = h
            .service
            .get_bars(&hour_request(day(1), day(2)))
            .await
            .unwrap();

        assert_eq!(series.len(), 24);
        assert!(report.is_complete());
        assert!(report
            .diagnostics
            .errors()
            .iter()
            .any(|(_, message)| message.contains("write-back failed")));
    }

    // =========================================================================
    // Deadline
    // =========================================================================

    #[tokio::test]
    async fn test_deadline_keeps_partial_progress() {
        let cache = Arc::new(MemoryCacheStore::new());
        let live = Arc::new(ScriptedSource::live());
        let service = BarService::new(
            cache.clone(),
            Arc::new(HangingSource),
            live.clone(),
            Arc::new(ManualClock::new(now())),
            BarsConfig::default(),
        );
        let cutoff = now() - Duration::hours(48);
        let request = hour_request(day(7), now()).deadline(std::time::Duration::from_millis(50));

        let (series, report) = service.get_bars(&request).await.unwrap();

        assert!(report.timed_out);
        assert_eq!(series.len(), 48);
        assert_eq!(series.first_open(), Some(cutoff));
        assert_eq!(
            report.unresolved,
            vec![Gap {
                start: day(7),
                end: cutoff - Duration::hours(1),
                missing_bars: 36,
            }]
        );
        assert!(report
            .diagnostics
            .attempts
            .iter()
            .any(|a| a.source_id == "VISION"
                && matches!(a.skipped, Some(SkipReason::DeadlineExceeded))));
        // Only the recent fetch went out; nothing ran after the deadline.
        assert_eq!(live.calls(), 1);

        let stats = cache.stats(&series.key).await.unwrap();
        assert_eq!(stats.coverage.ranges(), &[TimeRange::new(cutoff, now())]);
    }

    #[tokio::test]
    async fn test_deadline_keeps_pages_finished_before_it() {
        /// Answers the first page, then never answers again.
        struct StallingLive {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl LiveTransport for StallingLive {
            async fn query(
                &self,
                page: &PageQuery,
            ) -> std::result::Result<Vec<Bar>, MarketDataError> {
                if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                    return futures::future::pending().await;
                }
                let range = TimeRange::new(page.start, page.end);
                Ok(opens(page.key.interval, &range)
                    .into_iter()
                    .map(|open| bar(open, dec!(200), SourceKind::Live))
                    .collect())
            }
        }

        let clock = Arc::new(ManualClock::new(now()));
        let transport = Arc::new(StallingLive {
            calls: AtomicUsize::new(0),
        });
        let live = LiveQueryClient::new(transport.clone(), Arc::new(RateLimiter::new(clock.clone())))
            .with_page_size(10);
        let cache = Arc::new(MemoryCacheStore::new());
        let service = BarService::new(
            cache.clone(),
            Arc::new(ScriptedSource::archive()),
            Arc::new(live),
            clock,
            BarsConfig::default(),
        );
        let start = now() - Duration::minutes(20);
        let request =
            minute_request(start, now()).deadline(std::time::Duration::from_millis(100));

        let (series, report) = service.get_bars(&request).await.unwrap();

        assert!(report.timed_out);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        assert_eq!(series.len(), 10);
        assert_eq!(series.first_open(), Some(start));
        assert_eq!(
            report.unresolved,
            vec![Gap {
                start: start + Duration::minutes(10),
                end: now() - Duration::minutes(1),
                missing_bars: 10,
            }]
        );
        assert!(report
            .diagnostics
            .attempts
            .iter()
            .any(|a| a.source_id == "REST"
                && matches!(a.skipped, Some(SkipReason::DeadlineExceeded))));

        // The finished page is cached, the abandoned one is not.
        let stats = cache.stats(&series.key).await.unwrap();
        assert_eq!(stats.bars, 10);
        assert_eq!(
            stats.coverage.ranges(),
            &[TimeRange::new(start, start + Duration::minutes(10))]
        );
    }
}
