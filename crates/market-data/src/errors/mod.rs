//! Error types and retry classification for the market data crate.
//!
//! This module provides:
//! - [`MarketDataError`]: The main error enum for all market data operations
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use std::time::Duration;

use thiserror::Error;

use crate::models::{Interval, MarketType};

/// Errors that can occur during market data operations.
///
/// Each variant is classified into a [`RetryClass`] via the [`retry_class`](Self::retry_class)
/// method, which determines how the source clients should handle the error.
#[derive(Error, Debug)]
pub enum MarketDataError {
    /// The (interval, market) pair is not in the constraint table.
    /// This is a precondition failure - retrying won't help.
    #[error("Interval {interval} is not supported for {market} markets")]
    UnsupportedInterval {
        interval: Interval,
        market: MarketType,
    },

    #[error("Unknown interval: {0}")]
    UnknownInterval(String),

    #[error("Unknown market type: {0}")]
    UnknownMarket(String),

    /// The local weight budget is exhausted and the limiter is configured
    /// not to wait.
    #[error("Rate limit exceeded for {market}: retry after {retry_after:?}")]
    RateLimitExceeded {
        market: MarketType,
        retry_after: Duration,
    },

    /// A single call costs more weight than the whole window allows.
    #[error("Request weight {weight} exceeds the {market} budget of {limit}")]
    WeightExceedsBudget {
        market: MarketType,
        weight: u32,
        limit: u32,
    },

    /// A page asked for more bars than the source accepts per call.
    #[error("Page of {requested} bars exceeds the per-call ceiling of {ceiling}")]
    PageTooLarge { requested: usize, ceiling: usize },

    /// The remote side rate limited the request (HTTP 429/418).
    #[error("Rate limited: {provider}")]
    RateLimited {
        /// The provider that rate limited the request
        provider: String,
    },

    /// The request to the provider timed out.
    #[error("Timeout: {provider}")]
    Timeout {
        /// The provider that timed out
        provider: String,
    },

    /// The provider could not be reached or answered with a server error.
    #[error("Provider unavailable: {provider} - {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// The provider rejected the request (4xx other than 404/429).
    #[error("Request rejected by {provider}: {message}")]
    Rejected { provider: String, message: String },

    /// The payload could not be decoded.
    #[error("Invalid response from {provider}: {message}")]
    InvalidResponse { provider: String, message: String },

    /// A network error occurred while communicating with a provider.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl MarketDataError {
    /// Returns the retry classification for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use barvault_market_data::errors::{MarketDataError, RetryClass};
    ///
    /// let error = MarketDataError::Timeout { provider: "VISION".to_string() };
    /// assert_eq!(error.retry_class(), RetryClass::WithBackoff);
    ///
    /// let error = MarketDataError::UnknownInterval("7m".to_string());
    /// assert_eq!(error.retry_class(), RetryClass::Never);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            // Precondition and caller errors
            Self::UnsupportedInterval { .. }
            | Self::UnknownInterval(_)
            | Self::UnknownMarket(_)
            | Self::WeightExceedsBudget { .. }
            | Self::PageTooLarge { .. } => RetryClass::Never,

            // Transient
            Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::ProviderUnavailable { .. }
            | Self::InvalidResponse { .. }
            | Self::Network(_) => RetryClass::WithBackoff,

            // Local budget exhausted or request refused: let the cascade move on
            Self::RateLimitExceeded { .. } | Self::Rejected { .. } => RetryClass::NextSource,
        }
    }

    /// Maps a transport error onto the taxonomy above.
    pub fn from_transport(provider: &str, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                provider: provider.to_string(),
            }
        } else if error.is_connect() {
            Self::ProviderUnavailable {
                provider: provider.to_string(),
                message: error.to_string(),
            }
        } else {
            Self::Network(error)
        }
    }
}
