//! Bar retrieval.
//!
//! This module provides the cascade that turns a (symbol, market, interval,
//! range) request into a gap-checked series:
//!
//! - [`store`] - Storage trait for the cache tier
//! - [`memory`] - In-process `CacheStore`
//! - [`reindex`] - Canonical index and gap detection
//! - [`service`] - The orchestrator (`BarService::get_bars`)
//!
//! # Architecture
//!
//! ```text
//! BarService -> CacheStore (cache tier)
//!     |
//!     +-----> BarSource "VISION" (archive tier, settled ranges)
//!     +-----> BarSource "REST"   (live tier, recent ranges, fall-through, repairs)
//! ```

pub mod memory;
pub mod reindex;
pub mod service;
pub mod store;

#[cfg(test)]
mod service_tests;

pub use memory::{should_replace, MemoryCacheStore};
pub use reindex::{canonical_index, detect_gaps, reindex, Gap, Reindexed};
pub use service::{BarService, BarsRequest, FetchState, GapReport, CACHE_SOURCE_ID};
pub use store::{CacheStats, CacheStore};
