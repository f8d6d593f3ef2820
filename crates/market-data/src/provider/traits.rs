//! The fetch capability shared by every bar source.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::warn;

use crate::errors::MarketDataError;
use crate::models::{Bar, BarSeries, Coverage, SeriesKey, SourceKind, TimeRange};

/// What to fetch: one series over one half-open range.
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub key: SeriesKey,
    pub range: TimeRange,
    /// Where finished pages or files are reported while the fetch runs.
    pub progress: Option<Arc<PartialFetch>>,
}

impl FetchRequest {
    pub fn new(key: SeriesKey, range: TimeRange) -> Self {
        Self {
            key,
            range,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<PartialFetch>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Reports one finished window; a no-op without a progress sink.
    pub fn report_progress(&self, window: TimeRange, bars: &[Bar]) {
        if let Some(progress) = &self.progress {
            progress.record(window, bars);
        }
    }
}

impl PartialEq for FetchRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.range == other.range
    }
}

impl Eq for FetchRequest {}

/// Windows a source has finished while its fetch is still running.
///
/// A caller that stops waiting on the fetch drains this and keeps whatever
/// already arrived instead of losing it with the dropped future.
#[derive(Debug, Default)]
pub struct PartialFetch {
    state: Mutex<PartialState>,
}

#[derive(Debug, Default)]
struct PartialState {
    bars: Vec<Bar>,
    coverage: Coverage,
}

impl PartialFetch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, PartialState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Partial fetch mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Records `window` as answered with `bars`.
    pub fn record(&self, window: TimeRange, bars: &[Bar]) {
        let mut state = self.lock_state();
        state
            .bars
            .extend(bars.iter().filter(|b| window.contains(b.open_time)).cloned());
        state.coverage.insert(window);
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().coverage.is_empty()
    }

    /// Everything recorded so far; leaves the sink empty.
    pub fn take(&self, key: SeriesKey) -> FetchResult {
        let state = std::mem::take(&mut *self.lock_state());
        FetchResult {
            series: BarSeries::from_bars(key, state.bars),
            coverage: state.coverage,
            failure: None,
        }
    }
}

/// What a source delivered.
///
/// `coverage` says exactly which subranges the source answered for; it may
/// be smaller than the request. A failure that cut the fetch short travels
/// in `failure` next to whatever was obtained before it.
#[derive(Debug)]
pub struct FetchResult {
    pub series: BarSeries,
    pub coverage: Coverage,
    pub failure: Option<MarketDataError>,
}

impl FetchResult {
    /// Nothing fetched, nothing wrong (e.g. archive not published yet).
    pub fn empty(key: SeriesKey) -> Self {
        Self {
            series: BarSeries::new(key),
            coverage: Coverage::empty(),
            failure: None,
        }
    }

    pub fn failed(key: SeriesKey, error: MarketDataError) -> Self {
        Self {
            series: BarSeries::new(key),
            coverage: Coverage::empty(),
            failure: Some(error),
        }
    }

    pub fn is_complete(&self, range: &TimeRange) -> bool {
        self.failure.is_none() && self.coverage.covers(range)
    }
}

/// A source of bars.
///
/// Implementations never return `Err`: transient trouble is absorbed into
/// reduced coverage so the caller only reasons about which ranges it got.
///
/// # Example
///
/// ```ignore
/// use async_trait::async_trait;
/// use barvault_market_data::provider::{BarSource, FetchRequest, FetchResult};
///
/// struct Fixture;
///
/// #[async_trait]
/// impl BarSource for Fixture {
///     fn id(&self) -> &'static str {
///         "FIXTURE"
///     }
///
///     fn kind(&self) -> SourceKind {
///         SourceKind::Live
///     }
///
///     async fn fetch(&self, request: &FetchRequest) -> FetchResult {
///         FetchResult::empty(request.key.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait BarSource: Send + Sync {
    /// Unique identifier for this source.
    ///
    /// Should be a constant string like "VISION" or "REST".
    /// Used for logging and diagnostics.
    fn id(&self) -> &'static str;

    /// The tier this source belongs to, which decides conflict priority.
    fn kind(&self) -> SourceKind;

    /// Fetch bars for `request.range`.
    ///
    /// Sources that work in pages or files should report each finished one
    /// through [`FetchRequest::report_progress`], so a caller that gives up
    /// at a deadline still gets them.
    async fn fetch(&self, request: &FetchRequest) -> FetchResult;
}
