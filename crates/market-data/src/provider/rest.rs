//! Live klines transport.
//!
//! One `GET {market klines endpoint}?symbol=&interval=&startTime=&endTime=&limit=`
//! per page. The endpoint's `endTime` is inclusive, so the half-open page end
//! is sent minus one millisecond.
//!
//! Rows come back as positional JSON arrays:
//! `[openTime, "open", "high", "low", "close", "volume", closeTime, "quoteVolume", trades, ...]`

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::live::{LiveTransport, PageQuery};
use super::status_error;
use crate::errors::MarketDataError;
use crate::models::interval::from_millis;
use crate::models::{Bar, MarketType, SourceKind};

const PROVIDER_ID: &str = "REST";

/// Error body returned with 4xx answers.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    code: Option<i64>,
    msg: Option<String>,
}

/// HTTP access to the live klines endpoints.
pub struct RestKlines {
    client: Client,
    /// Replaces the per-market endpoint; used against local stubs.
    endpoint_override: Option<String>,
}

impl RestKlines {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            endpoint_override: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    fn endpoint(&self, market: MarketType) -> &str {
        self.endpoint_override
            .as_deref()
            .unwrap_or_else(|| market.klines_url())
    }

    fn query_params(page: &PageQuery) -> Vec<(&'static str, String)> {
        vec![
            ("symbol", page.key.symbol.clone()),
            ("interval", page.key.interval.as_str().to_string()),
            ("startTime", page.start.timestamp_millis().to_string()),
            ("endTime", (page.end.timestamp_millis() - 1).to_string()),
            ("limit", page.limit.to_string()),
        ]
    }
}

impl Default for RestKlines {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LiveTransport for RestKlines {
    async fn query(&self, page: &PageQuery) -> Result<Vec<Bar>, MarketDataError> {
        let url = self.endpoint(page.key.market);
        debug!(
            series = %page.key,
            start = %page.start,
            end = %page.end,
            limit = page.limit,
            "REST request"
        );

        let response = self
            .client
            .get(url)
            .query(&Self::query_params(page))
            .send()
            .await
            .map_err(|e| MarketDataError::from_transport(PROVIDER_ID, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MarketDataError::from_transport(PROVIDER_ID, e))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(ErrorResponse {
                    code: Some(code),
                    msg: Some(msg),
                }) => format!("{} ({})", msg, code),
                _ => body,
            };
            return Err(status_error(PROVIDER_ID, status, message));
        }

        parse_klines_json(&body)
    }
}

fn invalid(message: impl Into<String>) -> MarketDataError {
    MarketDataError::InvalidResponse {
        provider: PROVIDER_ID.to_string(),
        message: message.into(),
    }
}

fn decimal_at(row: &[Value], idx: usize) -> Result<Decimal, MarketDataError> {
    match row.get(idx) {
        Some(Value::String(s)) => {
            Decimal::from_str(s).map_err(|e| invalid(format!("column {}: {}", idx, e)))
        }
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .map_err(|e| invalid(format!("column {}: {}", idx, e))),
        other => Err(invalid(format!("column {}: unexpected {:?}", idx, other))),
    }
}

pub(crate) fn parse_klines_json(body: &str) -> Result<Vec<Bar>, MarketDataError> {
    let rows: Vec<Vec<Value>> =
        serde_json::from_str(body).map_err(|e| invalid(format!("Failed to parse klines: {}", e)))?;

    rows.iter()
        .map(|row| -> Result<Bar, MarketDataError> {
            let open_ms = row
                .first()
                .and_then(Value::as_i64)
                .ok_or_else(|| invalid("missing open time"))?;
            Ok(Bar {
                open_time: from_millis(open_ms),
                open: decimal_at(row, 1)?,
                high: decimal_at(row, 2)?,
                low: decimal_at(row, 3)?,
                close: decimal_at(row, 4)?,
                volume: decimal_at(row, 5)?,
                trade_count: row.get(8).and_then(Value::as_u64),
                provenance: SourceKind::Live,
            })
        })
        .collect()
}
