//! OHLCV bars and the source tiers that produce them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::MarketDataError;

/// Where a bar came from.
///
/// Stored bars only ever carry `Archive` or `Live`; `Cache` names the tier a
/// bar was read from during a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Cache,
    Archive,
    Live,
}

impl SourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Archive => "archive",
            Self::Live => "live",
        }
    }

    /// Conflict rank, lower wins.
    ///
    /// Settled bars (older than the archive cutoff) prefer
    /// Cache > Archive > Live; unsettled bars prefer Live > Cache > Archive.
    pub const fn rank(&self, settled: bool) -> u8 {
        match (self, settled) {
            (Self::Cache, true) => 0,
            (Self::Archive, true) => 1,
            (Self::Live, true) => 2,
            (Self::Live, false) => 0,
            (Self::Cache, false) => 1,
            (Self::Archive, false) => 2,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache" => Ok(Self::Cache),
            "archive" => Ok(Self::Archive),
            "live" => Ok(Self::Live),
            other => Err(MarketDataError::InvalidResponse {
                provider: "CACHE".to_string(),
                message: format!("unknown provenance '{}'", other),
            }),
        }
    }
}

/// One sampled period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bar {
    /// Aligned to the interval boundary.
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: Option<u64>,
    pub provenance: SourceKind,
}

impl Bar {
    pub fn with_provenance(mut self, provenance: SourceKind) -> Self {
        self.provenance = provenance;
        self
    }

    /// Low <= open, close <= high.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open.min(self.close)
            && self.high >= self.open.max(self.close)
    }
}
