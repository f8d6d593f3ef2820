//! Live query client.
//!
//! The live API answers at most `max_bars_per_call` bars per query, so a
//! long range is walked page by page from its start. Pages are issued one at
//! a time: each reserves its weight before the call, and a later page wins
//! any timestamp it shares with an earlier one. Every finished page is
//! reported as progress, so a caller that stops waiting keeps it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::sanitize_bars;
use super::traits::{BarSource, FetchRequest, FetchResult};
use crate::errors::MarketDataError;
use crate::models::{Bar, BarSeries, Coverage, MarketType, SeriesKey, SourceKind, TimeRange};
use crate::registry::RateLimiter;

/// One live query: bars opening in `[start, end)`, at most `limit` of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageQuery {
    pub key: SeriesKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: usize,
}

/// Raw access to the live API.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn query(&self, page: &PageQuery) -> Result<Vec<Bar>, MarketDataError>;
}

/// Live tier of the cascade.
pub struct LiveQueryClient {
    transport: Arc<dyn LiveTransport>,
    limiter: Arc<RateLimiter>,
    page_size: Option<usize>,
}

impl LiveQueryClient {
    pub const ID: &'static str = "REST";

    pub fn new(transport: Arc<dyn LiveTransport>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            transport,
            limiter,
            page_size: None,
        }
    }

    /// Use smaller pages than the market allows.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size.max(1));
        self
    }

    /// Per-call ceiling for `market`.
    pub fn max_bars_per_call(&self, market: MarketType) -> usize {
        let ceiling = market.max_bars_per_call();
        self.page_size.map_or(ceiling, |size| size.min(ceiling))
    }

    /// Weight one call of `limit` bars costs.
    pub fn request_weight(&self, market: MarketType, limit: usize) -> u32 {
        market.request_weight(limit)
    }

    async fn fetch_page(&self, page: &PageQuery) -> Result<Vec<Bar>, MarketDataError> {
        let ceiling = page.key.market.max_bars_per_call();
        if page.limit > ceiling {
            return Err(MarketDataError::PageTooLarge {
                requested: page.limit,
                ceiling,
            });
        }
        let weight = self.request_weight(page.key.market, page.limit);
        self.limiter.acquire(page.key.market, weight).await?;
        self.transport.query(page).await
    }
}

#[async_trait]
impl BarSource for LiveQueryClient {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let key = &request.key;
        let interval = key.interval;
        let page_size = self.max_bars_per_call(key.market);

        let mut bars = Vec::new();
        let mut coverage = Coverage::empty();
        let mut failure = None;
        let mut cursor = request.range.start;
        let mut pages = 0;

        while cursor < request.range.end {
            let page_end = interval
                .advance(cursor, page_size as u32)
                .min(request.range.end);
            let page = PageQuery {
                key: key.clone(),
                start: cursor,
                end: page_end,
                limit: interval.bars_between(cursor, page_end),
            };
            if page.limit == 0 {
                break;
            }

            match self.fetch_page(&page).await {
                Ok(page_bars) => {
                    let window = TimeRange::new(cursor, page_end);
                    let page_bars: Vec<Bar> = sanitize_bars(Self::ID, interval, page_bars)
                        .into_iter()
                        .filter(|b| window.contains(b.open_time))
                        .map(|b| b.with_provenance(SourceKind::Live))
                        .collect();
                    request.report_progress(window, &page_bars);
                    bars.extend(page_bars);
                    coverage.insert(window);
                    pages += 1;
                    cursor = page_end;
                }
                Err(error) => {
                    warn!(
                        "Live: page {} of {} failed after {} pages: {}",
                        TimeRange::new(cursor, page_end),
                        key,
                        pages,
                        error
                    );
                    failure = Some(error);
                    break;
                }
            }
        }

        debug!(
            "Live: {} {} -> {} bars in {} pages",
            key,
            request.range,
            bars.len(),
            pages
        );

        FetchResult {
            series: BarSeries::from_bars(key.clone(), bars),
            coverage,
            failure,
        }
    }
}
