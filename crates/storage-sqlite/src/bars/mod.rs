//! SQLite-backed bar cache.

mod model;
mod repository;

pub use model::{CacheBarDB, CoverageRowDB};
pub use repository::SqliteCacheStore;
