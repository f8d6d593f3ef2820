//! Market types and the interval constraint table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::interval::Interval;
use crate::errors::MarketDataError;

/// Market a symbol trades on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    /// Linear (USDT/USDC margined) futures.
    #[serde(rename = "um")]
    UsdMargined,
    /// Inverse (coin margined) futures.
    #[serde(rename = "cm")]
    CoinMargined,
}

const SPOT_INTERVALS: &[Interval] = &Interval::ALL;

const FUTURES_INTERVALS: &[Interval] = &[
    Interval::Minute1,
    Interval::Minute3,
    Interval::Minute5,
    Interval::Minute15,
    Interval::Minute30,
    Interval::Hour1,
    Interval::Hour2,
    Interval::Hour4,
    Interval::Hour6,
    Interval::Hour8,
    Interval::Hour12,
    Interval::Day1,
    Interval::Day3,
    Interval::Week1,
    Interval::Month1,
];

/// The only place interval legality is defined.
const CONSTRAINTS: &[(MarketType, &[Interval])] = &[
    (MarketType::Spot, SPOT_INTERVALS),
    (MarketType::UsdMargined, FUTURES_INTERVALS),
    (MarketType::CoinMargined, FUTURES_INTERVALS),
];

/// Whether bars of `interval` exist for `market`.
pub fn is_supported(interval: Interval, market: MarketType) -> bool {
    CONSTRAINTS
        .iter()
        .find(|(m, _)| *m == market)
        .is_some_and(|(_, intervals)| intervals.contains(&interval))
}

/// Precondition check run before any disk or network access.
pub fn validate(interval: Interval, market: MarketType) -> Result<(), MarketDataError> {
    if is_supported(interval, market) {
        Ok(())
    } else {
        Err(MarketDataError::UnsupportedInterval { interval, market })
    }
}

impl MarketType {
    pub const ALL: [MarketType; 3] = [
        MarketType::Spot,
        MarketType::UsdMargined,
        MarketType::CoinMargined,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::UsdMargined => "um",
            Self::CoinMargined => "cm",
        }
    }

    pub fn supports(&self, interval: Interval) -> bool {
        is_supported(interval, *self)
    }

    /// Path segment under the bulk archive root.
    pub const fn archive_path(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::UsdMargined => "futures/um",
            Self::CoinMargined => "futures/cm",
        }
    }

    pub const fn klines_url(&self) -> &'static str {
        match self {
            Self::Spot => "https://api.binance.com/api/v3/klines",
            Self::UsdMargined => "https://fapi.binance.com/fapi/v1/klines",
            Self::CoinMargined => "https://dapi.binance.com/dapi/v1/klines",
        }
    }

    /// Largest `limit` a single live query accepts.
    pub const fn max_bars_per_call(&self) -> usize {
        match self {
            Self::Spot => 1_000,
            Self::UsdMargined | Self::CoinMargined => 1_500,
        }
    }

    /// Request weight charged for one live query of `limit` bars.
    pub const fn request_weight(&self, limit: usize) -> u32 {
        match self {
            Self::Spot => 2,
            Self::UsdMargined | Self::CoinMargined => {
                if limit < 100 {
                    1
                } else if limit < 500 {
                    2
                } else if limit <= 1_000 {
                    5
                } else {
                    10
                }
            }
        }
    }

    /// Default weight budget per rolling minute.
    pub const fn weight_per_minute(&self) -> u32 {
        match self {
            Self::Spot => 6_000,
            Self::UsdMargined | Self::CoinMargined => 2_400,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Ok(Self::Spot),
            "um" | "futures/um" | "usdm" => Ok(Self::UsdMargined),
            "cm" | "futures/cm" | "coinm" => Ok(Self::CoinMargined),
            other => Err(MarketDataError::UnknownMarket(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_second_is_spot_only() {
        assert!(is_supported(Interval::Second1, MarketType::Spot));
        assert!(!is_supported(Interval::Second1, MarketType::UsdMargined));
        assert!(!is_supported(Interval::Second1, MarketType::CoinMargined));
    }

    #[test]
    fn test_every_market_has_a_constraint_row() {
        for market in MarketType::ALL {
            assert!(market.supports(Interval::Minute1));
            assert!(market.supports(Interval::Month1));
        }
    }

    #[test]
    fn test_validate_reports_the_pair() {
        let err = validate(Interval::Second1, MarketType::UsdMargined).unwrap_err();
        match err {
            MarketDataError::UnsupportedInterval { interval, market } => {
                assert_eq!(interval, Interval::Second1);
                assert_eq!(market, MarketType::UsdMargined);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(validate(Interval::Hour1, MarketType::Spot).is_ok());
    }

    #[test]
    fn test_futures_weight_steps_with_limit() {
        let market = MarketType::UsdMargined;
        assert_eq!(market.request_weight(99), 1);
        assert_eq!(market.request_weight(100), 2);
        assert_eq!(market.request_weight(1_000), 5);
        assert_eq!(market.request_weight(1_500), 10);
        assert_eq!(MarketType::Spot.request_weight(1_000), 2);
    }

    #[test]
    fn test_parse_market() {
        assert_eq!("SPOT".parse::<MarketType>().unwrap(), MarketType::Spot);
        assert_eq!("um".parse::<MarketType>().unwrap(), MarketType::UsdMargined);
        assert_eq!(
            "futures/cm".parse::<MarketType>().unwrap(),
            MarketType::CoinMargined
        );
        assert!("options".parse::<MarketType>().is_err());
    }
}
