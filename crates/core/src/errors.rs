//! Core error types for barvault.
//!
//! This module defines database-agnostic error types. Storage-specific errors
//! (from Diesel, SQLite, etc.) are converted to these types by the storage layer.

use barvault_market_data::{Interval, MarketDataError, MarketType};
use thiserror::Error;

use crate::bars::Gap;

/// Type alias for Result using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Root error type for bar retrieval.
///
/// Source failures never show up here: they are absorbed into reduced
/// coverage and reported as gaps. What remains are precondition violations,
/// strict-mode incompleteness, and storage trouble.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database operation failed: {0}")]
    Database(#[from] DatabaseError),

    /// The (interval, market) pair is not in the constraint table.
    #[error("Interval {interval} is not supported for {market} markets")]
    UnsupportedInterval {
        interval: Interval,
        market: MarketType,
    },

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// The normalized range spans more bars than one request may return.
    #[error("Range too large: {bars} bars requested, at most {limit} allowed")]
    RangeTooLarge { bars: usize, limit: usize },

    /// Strict mode only: the listed gaps could not be filled.
    #[error("Incomplete data: {} unresolved gap(s)", gaps.len())]
    IncompleteData { gaps: Vec<Gap> },

    /// Stored bars violate series invariants or cannot be decoded.
    #[error("Corrupt cache record for {key}: {message}")]
    CorruptCacheRecord { key: String, message: String },

    #[error("Market data operation failed: {0}")]
    MarketData(MarketDataError),

    #[error("Invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Caller mistakes, detected before any I/O.
    pub fn is_precondition(&self) -> bool {
        match self {
            Error::UnsupportedInterval { .. }
            | Error::InvalidRange(_)
            | Error::RangeTooLarge { .. } => true,
            Error::MarketData(e) => matches!(
                e,
                MarketDataError::UnknownInterval(_) | MarketDataError::UnknownMarket(_)
            ),
            _ => false,
        }
    }
}

impl From<MarketDataError> for Error {
    fn from(err: MarketDataError) -> Self {
        match err {
            MarketDataError::UnsupportedInterval { interval, market } => {
                Error::UnsupportedInterval { interval, market }
            }
            other => Error::MarketData(other),
        }
    }
}

/// Database-agnostic error type for storage operations.
///
/// This enum uses `String` for all error details, allowing the storage layer
/// to convert storage-specific errors (Diesel, SQLite, etc.) into this format.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to establish a database connection.
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to create or configure the connection pool.
    #[error("Failed to create database pool: {0}")]
    PoolCreationFailed(String),

    /// A database query failed to execute.
    #[error("Database query failed: {0}")]
    QueryFailed(String),

    /// A database transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Database migration failed.
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Internal/unexpected database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}
