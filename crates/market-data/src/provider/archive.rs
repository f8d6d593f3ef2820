//! Bulk archive client.
//!
//! The archive publishes one file per (symbol, interval, period): daily files
//! for intraday intervals, monthly files otherwise. A file only exists once
//! its whole period is older than the availability lag, so the client never
//! asks for anything newer than `now - lag`. Files are handled as they land
//! and each one is reported as progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use super::traits::{BarSource, FetchRequest, FetchResult};
use super::sanitize_bars;
use crate::clock::Clock;
use crate::errors::{MarketDataError, RetryClass};
use crate::models::{Bar, BarSeries, Coverage, Interval, SeriesKey, SourceKind, TimeRange};

/// Default availability lag.
pub const DEFAULT_AVAILABILITY_LAG: Duration = Duration::from_secs(48 * 3_600);

/// Files fetched concurrently within one request.
const DEFAULT_FILE_CONCURRENCY: usize = 4;

/// One archive file's worth of time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchivePeriod {
    Daily(NaiveDate),
    Monthly { year: i32, month: u32 },
}

impl ArchivePeriod {
    /// Periods overlapping `range`, oldest first.
    pub fn covering(interval: Interval, range: &TimeRange) -> Vec<ArchivePeriod> {
        if range.is_empty() {
            return Vec::new();
        }
        let first = range.start.date_naive();
        let last = (range.end - chrono::Duration::milliseconds(1)).date_naive();

        let mut periods = Vec::new();
        if interval.is_intraday() {
            let mut day = first;
            while day <= last {
                periods.push(ArchivePeriod::Daily(day));
                match day.succ_opt() {
                    Some(next) => day = next,
                    None => break,
                }
            }
        } else {
            let (mut year, mut month) = (first.year(), first.month());
            while (year, month) <= (last.year(), last.month()) {
                periods.push(ArchivePeriod::Monthly { year, month });
                (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            }
        }
        periods
    }

    pub fn range(&self) -> TimeRange {
        match *self {
            ArchivePeriod::Daily(day) => {
                let start = midnight(day);
                TimeRange::new(start, start + chrono::Duration::days(1))
            }
            ArchivePeriod::Monthly { year, month } => {
                let start = Utc
                    .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                TimeRange::new(start, Interval::Month1.advance(start, 1))
            }
        }
    }

    /// `daily` or `monthly`, as used in archive paths.
    pub fn frequency(&self) -> &'static str {
        match self {
            ArchivePeriod::Daily(_) => "daily",
            ArchivePeriod::Monthly { .. } => "monthly",
        }
    }

    /// Date part of the file name: `2024-01-15` or `2024-01`.
    pub fn label(&self) -> String {
        match *self {
            ArchivePeriod::Daily(day) => day.format("%Y-%m-%d").to_string(),
            ArchivePeriod::Monthly { year, month } => format!("{:04}-{:02}", year, month),
        }
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(chrono::NaiveTime::MIN))
}

/// Bounded exponential backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base, 2·base, 4·base, …
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Raw access to archive files.
#[async_trait]
pub trait ArchiveTransport: Send + Sync {
    /// Download and decode one file. `Ok(None)` means the file does not exist.
    async fn fetch_file(
        &self,
        key: &SeriesKey,
        period: &ArchivePeriod,
    ) -> Result<Option<Vec<Bar>>, MarketDataError>;
}

/// Archive tier of the cascade.
pub struct BulkArchiveClient {
    transport: Arc<dyn ArchiveTransport>,
    clock: Arc<dyn Clock>,
    lag: Duration,
    retry: RetryPolicy,
    concurrency: usize,
}

impl BulkArchiveClient {
    pub const ID: &'static str = "VISION";

    pub fn new(transport: Arc<dyn ArchiveTransport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            lag: DEFAULT_AVAILABILITY_LAG,
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_FILE_CONCURRENCY,
        }
    }

    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn availability_lag(&self) -> Duration {
        self.lag
    }

    /// Nothing at or after this instant is published yet.
    pub fn cutoff(&self) -> DateTime<Utc> {
        let lag = chrono::Duration::from_std(self.lag).unwrap_or_else(|_| chrono::Duration::zero());
        self.clock.utc_now() - lag
    }

    async fn fetch_period(
        &self,
        key: &SeriesKey,
        period: &ArchivePeriod,
    ) -> Result<Option<Vec<Bar>>, MarketDataError> {
        let mut attempt = 1;
        loop {
            match self.transport.fetch_file(key, period).await {
                Ok(bars) => return Ok(bars),
                Err(error)
                    if error.retry_class() == RetryClass::WithBackoff
                        && attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Archive {} {} attempt {}/{} failed: {}; retrying in {:?}",
                        key,
                        period.label(),
                        attempt,
                        self.retry.max_attempts,
                        error,
                        delay
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl BarSource for BulkArchiveClient {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Archive
    }

    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let key = &request.key;
        let cutoff = self.cutoff();
        let eligible = TimeRange::new(request.range.start, request.range.end.min(cutoff));
        if eligible.is_empty() {
            debug!("Archive: {} {} is newer than cutoff {}", key, request.range, cutoff);
            return FetchResult::empty(key.clone());
        }

        let periods: Vec<ArchivePeriod> = ArchivePeriod::covering(key.interval, &eligible)
            .into_iter()
            .filter(|p| p.range().end <= cutoff)
            .collect();

        let mut outcomes = stream::iter(periods)
            .map(|period| async move {
                let outcome = self.fetch_period(key, &period).await;
                (period, outcome)
            })
            .buffer_unordered(self.concurrency);

        let mut bars = Vec::new();
        let mut coverage = Coverage::empty();
        let mut failure = None;
        while let Some((period, outcome)) = outcomes.next().await {
            let Some(window) = period.range().intersect(&request.range) else {
                continue;
            };
            match outcome {
                Ok(Some(file_bars)) => {
                    let file_bars: Vec<Bar> = sanitize_bars(Self::ID, key.interval, file_bars)
                        .into_iter()
                        .filter(|b| window.contains(b.open_time))
                        .map(|b| b.with_provenance(SourceKind::Archive))
                        .collect();
                    request.report_progress(window, &file_bars);
                    bars.extend(file_bars);
                    coverage.insert(window);
                }
                Ok(None) => {
                    debug!("Archive: no file for {} {}", key, period.label());
                }
                Err(error) => {
                    warn!(
                        "Archive: giving up on {} {}: {}",
                        key,
                        period.label(),
                        error
                    );
                    failure = Some(error);
                }
            }
        }

        info!(
            "Archive: {} {} -> {} bars, coverage {}",
            key,
            request.range,
            bars.len(),
            coverage
        );

        FetchResult {
            series: BarSeries::from_bars(key.clone(), bars),
            coverage,
            failure,
        }
    }
}
