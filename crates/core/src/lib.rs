//! Barvault Core - bar retrieval across cache, archive and live sources.
//!
//! This crate contains the failover cascade itself. It is database-agnostic
//! and defines the `CacheStore` trait implemented by the `storage-sqlite`
//! crate; the sources come from `barvault-market-data`.

pub mod bars;
pub mod config;
pub mod errors;

pub use bars::{BarService, BarsRequest, CacheStore, Gap, GapReport, MemoryCacheStore};
pub use config::BarsConfig;

// Re-export error types
pub use errors::Error;
pub use errors::Result;
