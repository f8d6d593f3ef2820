//! Retrieval settings read from the environment.

use std::str::FromStr;
use std::time::Duration;

use barvault_market_data::{LimiterMode, MarketType, RetryPolicy, WeightBudget};
use log::warn;

/// Default availability lag of the archive, in hours.
pub const DEFAULT_ARCHIVE_LAG_HOURS: u64 = 48;

/// Gaps longer than this many bars are reported instead of repaired.
pub const DEFAULT_MAX_REPAIR_BARS: usize = 1_000;

/// Most bars one request may span after normalization.
pub const DEFAULT_MAX_REQUEST_BARS: usize = 1_000_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarsConfig {
    pub archive_lag: Duration,
    /// Default for requests that do not say.
    pub strict: bool,
    pub max_repair_bars: usize,
    pub max_request_bars: usize,
    /// Default for requests that do not say; `None` waits indefinitely.
    pub deadline: Option<Duration>,
    pub limiter_mode: LimiterMode,
    pub archive_retry: RetryPolicy,
    pub archive_base_url: Option<String>,
    pub spot_weight_per_minute: u32,
    pub futures_weight_per_minute: u32,
}

impl Default for BarsConfig {
    fn default() -> Self {
        Self {
            archive_lag: Duration::from_secs(DEFAULT_ARCHIVE_LAG_HOURS * 3_600),
            strict: false,
            max_repair_bars: DEFAULT_MAX_REPAIR_BARS,
            max_request_bars: DEFAULT_MAX_REQUEST_BARS,
            deadline: None,
            limiter_mode: LimiterMode::Blocking,
            archive_retry: RetryPolicy::default(),
            archive_base_url: None,
            spot_weight_per_minute: MarketType::Spot.weight_per_minute(),
            futures_weight_per_minute: MarketType::UsdMargined.weight_per_minute(),
        }
    }
}

impl BarsConfig {
    /// Reads `BARVAULT_*` variables, loading `.env` first if present.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source. Missing or malformed values
    /// fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |name: &str| -> Option<String> {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let lag_hours = parse_or(&parsed, "BARVAULT_ARCHIVE_LAG_HOURS", DEFAULT_ARCHIVE_LAG_HOURS);
        let deadline_ms: Option<u64> = parsed("BARVAULT_DEADLINE_MS").and_then(|v| {
            v.parse()
                .map_err(|_| warn!("Ignoring invalid BARVAULT_DEADLINE_MS '{}'", v))
                .ok()
        });
        let limiter_mode = match parsed("BARVAULT_RATE_LIMIT_MODE").as_deref() {
            None | Some("block") => LimiterMode::Blocking,
            Some("fail") => LimiterMode::FailFast,
            Some(other) => {
                warn!(
                    "Ignoring invalid BARVAULT_RATE_LIMIT_MODE '{}', expected block or fail",
                    other
                );
                LimiterMode::Blocking
            }
        };
        let archive_retry = RetryPolicy {
            max_attempts: parse_or(
                &parsed,
                "BARVAULT_ARCHIVE_MAX_ATTEMPTS",
                defaults.archive_retry.max_attempts,
            )
            .max(1),
            base_delay: Duration::from_millis(parse_or(
                &parsed,
                "BARVAULT_ARCHIVE_BACKOFF_MS",
                defaults.archive_retry.base_delay.as_millis() as u64,
            )),
            ..defaults.archive_retry
        };

        Self {
            archive_lag: Duration::from_secs(lag_hours * 3_600),
            strict: parse_or(&parsed, "BARVAULT_STRICT", defaults.strict),
            max_repair_bars: parse_or(&parsed, "BARVAULT_MAX_REPAIR_BARS", defaults.max_repair_bars),
            max_request_bars: parse_or(
                &parsed,
                "BARVAULT_MAX_REQUEST_BARS",
                defaults.max_request_bars,
            )
            .max(1),
            deadline: deadline_ms.map(Duration::from_millis),
            limiter_mode,
            archive_retry,
            archive_base_url: parsed("BARVAULT_ARCHIVE_BASE_URL"),
            spot_weight_per_minute: parse_or(
                &parsed,
                "BARVAULT_SPOT_WEIGHT_PER_MINUTE",
                defaults.spot_weight_per_minute,
            ),
            futures_weight_per_minute: parse_or(
                &parsed,
                "BARVAULT_FUTURES_WEIGHT_PER_MINUTE",
                defaults.futures_weight_per_minute,
            ),
        }
    }

    /// Weight budget for `market` under this config.
    pub fn weight_budget(&self, market: MarketType) -> WeightBudget {
        match market {
            MarketType::Spot => WeightBudget::per_minute(self.spot_weight_per_minute),
            MarketType::UsdMargined | MarketType::CoinMargined => {
                WeightBudget::per_minute(self.futures_weight_per_minute)
            }
        }
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {} '{}', using default", name, raw);
            default
        }),
    }
}
