//! Sampling intervals and their boundary arithmetic.
//!
//! Fixed-length intervals align to multiples of their duration counted from
//! an anchor (the Unix epoch, or the first Monday after it for weekly bars).
//! The monthly interval follows the calendar instead.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::MarketDataError;

const MS_PER_SECOND: i64 = 1_000;

/// 1970-01-05T00:00:00Z, the first Monday after the epoch.
const MONDAY_ANCHOR_SECS: i64 = 4 * 86_400;

/// Nominal length used to order the calendar month among fixed intervals.
const NOMINAL_MONTH_SECS: i64 = 30 * 86_400;

/// Sampling period of a bar series.
///
/// Variants are declared shortest first, so the derived `Ord` follows
/// duration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    Second1,
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "8h")]
    Hour8,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "3d")]
    Day3,
    #[serde(rename = "1w")]
    Week1,
    #[serde(rename = "1M")]
    Month1,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::Second1,
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

    /// Exchange tag, e.g. `"1m"` or `"1M"`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Second1 => "1s",
            Self::Minute1 => "1m",
            Self::Minute3 => "3m",
            Self::Minute5 => "5m",
            Self::Minute15 => "15m",
            Self::Minute30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour4 => "4h",
            Self::Hour6 => "6h",
            Self::Hour8 => "8h",
            Self::Hour12 => "12h",
            Self::Day1 => "1d",
            Self::Day3 => "3d",
            Self::Week1 => "1w",
            Self::Month1 => "1M",
        }
    }

    /// Bar length in seconds. The calendar month reports a nominal 30 days.
    pub const fn duration_seconds(&self) -> i64 {
        match self {
            Self::Second1 => 1,
            Self::Minute1 => 60,
            Self::Minute3 => 3 * 60,
            Self::Minute5 => 5 * 60,
            Self::Minute15 => 15 * 60,
            Self::Minute30 => 30 * 60,
            Self::Hour1 => 3_600,
            Self::Hour2 => 2 * 3_600,
            Self::Hour4 => 4 * 3_600,
            Self::Hour6 => 6 * 3_600,
            Self::Hour8 => 8 * 3_600,
            Self::Hour12 => 12 * 3_600,
            Self::Day1 => 86_400,
            Self::Day3 => 3 * 86_400,
            Self::Week1 => 7 * 86_400,
            Self::Month1 => NOMINAL_MONTH_SECS,
        }
    }

    pub const fn is_calendar(&self) -> bool {
        matches!(self, Self::Month1)
    }

    /// Intraday intervals are archived as daily files, longer ones monthly.
    pub const fn is_intraday(&self) -> bool {
        self.duration_seconds() < 86_400
    }

    /// The boundary rule the reindexer steps with.
    pub const fn resample_rule(&self) -> ResampleRule {
        match self {
            Self::Month1 => ResampleRule::CalendarMonth,
            Self::Week1 => ResampleRule::Fixed {
                seconds: self.duration_seconds(),
                anchor_seconds: MONDAY_ANCHOR_SECS,
            },
            _ => ResampleRule::Fixed {
                seconds: self.duration_seconds(),
                anchor_seconds: 0,
            },
        }
    }

    /// Rounds `ts` down to the open time of the bar containing it.
    pub fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.resample_rule().floor(ts)
    }

    pub fn is_aligned(&self, ts: DateTime<Utc>) -> bool {
        self.align(ts) == ts
    }

    /// Rounds `ts` up to the next bar boundary (identity when aligned).
    pub fn align_up(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let floor = self.align(ts);
        if floor == ts {
            ts
        } else {
            self.advance(floor, 1)
        }
    }

    /// Moves an aligned open time forward by `bars` bars.
    pub fn advance(&self, open: DateTime<Utc>, bars: u32) -> DateTime<Utc> {
        self.resample_rule().step(open, bars)
    }

    /// Number of bar opens in `[start, end)`.
    pub fn bars_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        let first = self.align_up(start);
        if first >= end {
            return 0;
        }
        match self.resample_rule() {
            ResampleRule::Fixed { seconds, .. } => {
                let span = end.timestamp_millis() - first.timestamp_millis();
                let step = seconds * MS_PER_SECOND;
                ((span + step - 1) / step) as usize
            }
            ResampleRule::CalendarMonth => {
                let last = self.align(end);
                let extra = if last == end { 0 } else { 1 };
                (month_index(last) - month_index(first) + extra).max(0) as usize
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = MarketDataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|interval| interval.as_str() == s)
            .ok_or_else(|| MarketDataError::UnknownInterval(s.to_string()))
    }
}

/// How bar boundaries are laid out in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResampleRule {
    /// Boundaries every `seconds`, counted from `anchor_seconds` past the epoch.
    Fixed { seconds: i64, anchor_seconds: i64 },
    /// Boundaries on the first instant of each calendar month (UTC).
    CalendarMonth,
}

impl ResampleRule {
    /// Pandas-style offset alias, e.g. `"15min"`, `"1W-MON"`, `"1MS"`.
    pub fn token(&self) -> String {
        match *self {
            Self::CalendarMonth => "1MS".to_string(),
            Self::Fixed { anchor_seconds, .. } if anchor_seconds == MONDAY_ANCHOR_SECS => {
                "1W-MON".to_string()
            }
            Self::Fixed { seconds, .. } if seconds % 86_400 == 0 => {
                format!("{}D", seconds / 86_400)
            }
            Self::Fixed { seconds, .. } if seconds % 3_600 == 0 => format!("{}h", seconds / 3_600),
            Self::Fixed { seconds, .. } if seconds % 60 == 0 => format!("{}min", seconds / 60),
            Self::Fixed { seconds, .. } => format!("{}s", seconds),
        }
    }

    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Self::Fixed {
                seconds,
                anchor_seconds,
            } => {
                let ms = ts.timestamp_millis();
                let step = seconds * MS_PER_SECOND;
                let offset = (ms - anchor_seconds * MS_PER_SECOND).rem_euclid(step);
                from_millis(ms - offset)
            }
            Self::CalendarMonth => Utc
                .with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(ts),
        }
    }

    pub fn step(&self, open: DateTime<Utc>, bars: u32) -> DateTime<Utc> {
        match *self {
            Self::Fixed { seconds, .. } => {
                from_millis(open.timestamp_millis() + i64::from(bars) * seconds * MS_PER_SECOND)
            }
            Self::CalendarMonth => open
                .checked_add_months(Months::new(bars))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl fmt::Display for ResampleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn month_index(ts: DateTime<Utc>) -> i64 {
    i64::from(ts.year()) * 12 + i64::from(ts.month0())
}
