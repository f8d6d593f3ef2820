//! Bar sources and their transports.
//!
//! This module contains:
//! - The `BarSource` trait every tier implements
//! - `BulkArchiveClient`, the archive tier, over an `ArchiveTransport`
//! - `LiveQueryClient`, the paginated and rate-limited live tier, over a `LiveTransport`
//! - Concrete HTTP transports (`VisionArchive`, `RestKlines`)
//!
//! # Architecture
//!
//! Clients own the cascade-facing policy (availability lag, retries,
//! pagination, rate budget); transports only move bytes and decode them.
//! Tests swap the transport and keep the policy.

mod archive;
mod live;
mod rest;
mod traits;
mod vision;

use log::warn;
use reqwest::StatusCode;

use crate::errors::MarketDataError;
use crate::models::{Bar, Interval};

// Re-exports
pub use archive::{
    ArchivePeriod, ArchiveTransport, BulkArchiveClient, RetryPolicy, DEFAULT_AVAILABILITY_LAG,
};
pub use live::{LiveQueryClient, LiveTransport, PageQuery};
pub use rest::RestKlines;
pub use traits::{BarSource, FetchRequest, FetchResult, PartialFetch};
pub use vision::VisionArchive;

/// Drops bars that sit off the interval grid and reports OHLC oddities.
pub(crate) fn sanitize_bars(source: &str, interval: Interval, bars: Vec<Bar>) -> Vec<Bar> {
    let total = bars.len();
    let mut inconsistent = 0;
    let kept: Vec<Bar> = bars
        .into_iter()
        .filter(|bar| {
            if !bar.is_consistent() {
                inconsistent += 1;
            }
            interval.is_aligned(bar.open_time)
        })
        .collect();

    if kept.len() < total {
        warn!(
            "{}: dropped {} bars off the {} grid",
            source,
            total - kept.len(),
            interval
        );
    }
    if inconsistent > 0 {
        warn!("{}: {} bars have high/low outside open/close", source, inconsistent);
    }
    kept
}

/// Maps a non-success HTTP status onto the error taxonomy.
pub(crate) fn status_error(provider: &str, status: StatusCode, message: String) -> MarketDataError {
    let provider = provider.to_string();
    match status.as_u16() {
        429 | 418 => MarketDataError::RateLimited { provider },
        500..=599 => MarketDataError::ProviderUnavailable {
            provider,
            message: format!("{}: {}", status, message),
        },
        _ => MarketDataError::Rejected {
            provider,
            message: format!("{}: {}", status, message),
        },
    }
}
