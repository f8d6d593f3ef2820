//! Market data models
//!
//! This module contains the core value types of bar retrieval:
//! - `interval` - Sampling intervals, alignment and resample rules
//! - `market` - Market types and the interval constraint table
//! - `bar` - OHLCV bars and source tiers (SourceKind)
//! - `series` - Ordered bar sequences (BarSeries) and their identity (SeriesKey)
//! - `range` - Half-open time ranges (TimeRange)
//! - `coverage` - What a source actually delivered (Coverage)
//! - `types` - Type aliases for common identifiers

mod bar;
mod coverage;
pub mod interval;
pub mod market;
mod range;
mod series;
mod types;

pub use bar::{Bar, SourceKind};
pub use coverage::Coverage;
pub use interval::{Interval, ResampleRule};
pub use market::MarketType;
pub use range::TimeRange;
pub use series::{BarSeries, SeriesKey, SeriesViolation};
pub use types::ProviderId;
