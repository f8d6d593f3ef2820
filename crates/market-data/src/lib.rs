//! Barvault Market Data Crate
//!
//! This crate provides the source side of bar retrieval: the value types,
//! the sources bars come from, and the shared limits those sources obey.
//!
//! # Overview
//!
//! The market data crate supports:
//! - Spot, USD-margined and coin-margined markets, each with its own
//!   interval table, page ceiling and weight budget
//! - A bulk archive tier (daily/monthly files, published with a lag)
//! - A live tier (paginated queries under a rolling weight budget)
//! - Coverage tracking, so callers know exactly which ranges a source answered
//!
//! # Architecture
//!
//! ```text
//!                        +------------------+
//!                        |  FetchRequest    |  (SeriesKey + TimeRange)
//!                        +------------------+
//!                                 |
//!                 +---------------+---------------+
//!                 v                               v
//!       +-------------------+           +-------------------+
//!       | BulkArchiveClient |           |  LiveQueryClient  |  (BarSource)
//!       | lag, retry/backoff|           | pages, RateLimiter|
//!       +-------------------+           +-------------------+
//!                 |                               |
//!                 v                               v
//!       +-------------------+           +-------------------+
//!       |   VisionArchive   |           |    RestKlines     |  (transports)
//!       +-------------------+           +-------------------+
//!                 |                               |
//!                 +---------------+---------------+
//!                                 v
//!                        +------------------+
//!                        |   FetchResult    |  (BarSeries + Coverage + failure)
//!                        +------------------+
//! ```
//!
//! # Core Types
//!
//! - [`Interval`] - Sampling period with alignment arithmetic
//! - [`MarketType`] - Market family and its constraints
//! - [`Bar`] / [`BarSeries`] - OHLCV data, strictly ordered by open time
//! - [`TimeRange`] / [`Coverage`] - Half-open ranges and sets of them
//! - [`RateLimiter`] - Per-market rolling weight budget
//! - [`Clock`] - Injectable time, so tests never sleep

pub mod clock;
pub mod errors;
pub mod models;
pub mod provider;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{MarketDataError, RetryClass};

pub use models::{
    Bar, BarSeries, Coverage, Interval, MarketType, ResampleRule, SeriesKey, SeriesViolation,
    SourceKind, TimeRange,
};

pub use provider::{
    ArchivePeriod, ArchiveTransport, BarSource, BulkArchiveClient, FetchRequest, FetchResult,
    LiveQueryClient, LiveTransport, PageQuery, PartialFetch, RestKlines, RetryPolicy,
    VisionArchive, DEFAULT_AVAILABILITY_LAG,
};

pub use registry::{
    FetchDiagnostics, LimiterMode, RateLimiter, Reservation, SkipReason, SourceAttempt,
    WeightBudget,
};
