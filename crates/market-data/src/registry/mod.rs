//! Shared source-side resources.
//!
//! This module provides:
//! - Weight-based rate limiting per market type
//! - Per-request diagnostics of source attempts

mod rate_limiter;
mod skip_reason;

pub use rate_limiter::{LimiterMode, RateLimiter, Reservation, WeightBudget};
pub use skip_reason::{FetchDiagnostics, SkipReason, SourceAttempt};
