//! SQLite storage implementation for barvault.
//!
//! This crate provides the persistent bar cache using Diesel ORM with SQLite.
//! It implements the `CacheStore` trait defined in `barvault-core` and contains:
//! - Database connection pooling and management
//! - Diesel migrations
//! - A single writer actor that serializes cache mutations
//! - Database-specific model types (with Diesel derives)
//!
//! # Architecture
//!
//! This crate is the only place where Diesel dependencies exist. `core` works
//! with the `CacheStore` trait and never sees a connection.
//!
//! ```text
//! core (orchestration)     market-data (sources)
//!       │                          │
//!       └────────────┬─────────────┘
//!                    │
//!                    ▼
//!          storage-sqlite (this crate)
//!                    │
//!                    ▼
//!                SQLite DB
//! ```

pub mod bars;
pub mod db;
pub mod errors;
pub mod schema;
mod utils;

pub use bars::SqliteCacheStore;

// Re-export database utilities
pub use db::{
    create_pool, get_connection, init, run_migrations, spawn_writer, DbConnection,
    DbPool, WriteHandle,
};

// Re-export storage errors and conversion helpers
pub use errors::{IntoCore, StorageError};

// Re-export from barvault-core for convenience
pub use barvault_core::errors::{DatabaseError, Error, Result};
