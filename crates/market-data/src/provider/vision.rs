//! Bulk archive transport.
//!
//! Files live at
//! `{base}/{spot|futures/um|futures/cm}/{daily|monthly}/klines/{SYMBOL}/{interval}/{SYMBOL}-{interval}-{label}.zip`
//! and hold a single header-less CSV with one kline per row:
//!
//! ```text
//! open_time,open,high,low,close,volume,close_time,quote_volume,count,taker_base,taker_quote,ignore
//! ```
//!
//! Spot files from 2025 on carry microsecond timestamps; everything else uses
//! milliseconds. Some futures files start with a header row, which is skipped.

use std::io::{Cursor, Read};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::archive::{ArchivePeriod, ArchiveTransport};
use super::status_error;
use crate::errors::MarketDataError;
use crate::models::{Bar, SeriesKey, SourceKind};
use crate::models::interval::from_millis;

const BASE_URL: &str = "https://data.binance.vision/data";
const PROVIDER_ID: &str = "VISION";

/// Timestamps above this are microseconds.
const MICROS_THRESHOLD: i64 = 100_000_000_000_000;

/// HTTP access to the public kline archive.
pub struct VisionArchive {
    client: Client,
    base_url: String,
}

impl VisionArchive {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn file_url(&self, key: &SeriesKey, period: &ArchivePeriod) -> String {
        let interval = key.interval.as_str();
        format!(
            "{}/{}/{}/klines/{}/{}/{}-{}-{}.zip",
            self.base_url,
            key.market.archive_path(),
            period.frequency(),
            key.symbol,
            interval,
            key.symbol,
            interval,
            period.label()
        )
    }
}

impl Default for VisionArchive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArchiveTransport for VisionArchive {
    async fn fetch_file(
        &self,
        key: &SeriesKey,
        period: &ArchivePeriod,
    ) -> Result<Option<Vec<Bar>>, MarketDataError> {
        let url = self.file_url(key, period);
        debug!(url = %url, "Vision request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| MarketDataError::from_transport(PROVIDER_ID, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(series = %key, period = %period.label(), "Vision file not published");
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(PROVIDER_ID, status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MarketDataError::from_transport(PROVIDER_ID, e))?;
        let bars = parse_archive(&bytes)?;
        debug!(
            series = %key,
            period = %period.label(),
            bars = bars.len(),
            "Vision file decoded"
        );
        Ok(Some(bars))
    }
}

fn invalid(message: impl Into<String>) -> MarketDataError {
    MarketDataError::InvalidResponse {
        provider: PROVIDER_ID.to_string(),
        message: message.into(),
    }
}

/// Unzip an archive file and parse the CSV inside it.
pub(crate) fn parse_archive(bytes: &[u8]) -> Result<Vec<Bar>, MarketDataError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| invalid(format!("Bad zip: {}", e)))?;
    if archive.is_empty() {
        return Err(invalid("Empty zip"));
    }

    let mut csv_bytes = Vec::new();
    archive
        .by_index(0)
        .map_err(|e| invalid(format!("Bad zip entry: {}", e)))?
        .read_to_end(&mut csv_bytes)
        .map_err(|e| invalid(format!("Failed to inflate: {}", e)))?;

    parse_klines_csv(&csv_bytes)
}

pub(crate) fn parse_klines_csv(data: &[u8]) -> Result<Vec<Bar>, MarketDataError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let mut bars = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| invalid(format!("CSV line {}: {}", line + 1, e)))?;

        // Header rows have a non-numeric first column.
        let Some(Ok(raw_open)) = record.get(0).map(|f| f.trim().parse::<i64>()) else {
            continue;
        };
        if record.len() < 6 {
            return Err(invalid(format!(
                "CSV line {}: expected at least 6 columns, got {}",
                line + 1,
                record.len()
            )));
        }

        let open_ms = if raw_open > MICROS_THRESHOLD {
            raw_open / 1_000
        } else {
            raw_open
        };
        let decimal = |idx: usize| -> Result<Decimal, MarketDataError> {
            let field = record.get(idx).unwrap_or_default().trim();
            Decimal::from_str(field)
                .or_else(|_| Decimal::from_scientific(field))
                .map_err(|e| invalid(format!("CSV line {} column {}: {}", line + 1, idx, e)))
        };

        bars.push(Bar {
            open_time: from_millis(open_ms),
            open: decimal(1)?,
            high: decimal(2)?,
            low: decimal(3)?,
            close: decimal(4)?,
            volume: decimal(5)?,
            trade_count: record.get(8).and_then(|f| f.trim().parse::<u64>().ok()),
            provenance: SourceKind::Archive,
        });
    }

    if bars.is_empty() {
        warn!("Vision file contained no klines");
    }
    Ok(bars)
}
