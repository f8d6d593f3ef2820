use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use barvault_core::bars::{BarsRequest, CacheStats, CacheStore, GapReport};
use barvault_core::Error;
use barvault_market_data::{BarSeries, Interval, MarketType, SeriesKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    main_lib::AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BarsQuery {
    symbol: String,
    market: String,
    interval: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    strict: Option<bool>,
    deadline_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeriesQuery {
    symbol: String,
    market: String,
    interval: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BarsResponse {
    series: BarSeries,
    report: GapReport,
}

fn parse_series(symbol: &str, market: &str, interval: &str) -> ApiResult<SeriesKey> {
    if symbol.trim().is_empty() {
        return Err(ApiError::BadRequest("symbol must not be empty".to_string()));
    }
    let market = MarketType::from_str(market).map_err(Error::from)?;
    let interval = Interval::from_str(interval).map_err(Error::from)?;
    Ok(SeriesKey::new(symbol.trim(), market, interval))
}

async fn get_bars(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BarsQuery>,
) -> ApiResult<Json<BarsResponse>> {
    let key = parse_series(&q.symbol, &q.market, &q.interval)?;
    let mut request = BarsRequest::new(key.symbol, key.market, key.interval, q.start, q.end);
    if let Some(strict) = q.strict {
        request = request.strict(strict);
    }
    if let Some(ms) = q.deadline_ms {
        request = request.deadline(Duration::from_millis(ms));
    }

    let (series, report) = state.bar_service.get_bars(&request).await?;
    Ok(Json(BarsResponse { series, report }))
}

async fn get_cache_stats(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SeriesQuery>,
) -> ApiResult<Json<CacheStats>> {
    let key = parse_series(&q.symbol, &q.market, &q.interval)?;
    let stats = state.bar_service.cache().stats(&key).await?;
    Ok(Json(stats))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bars", get(get_bars))
        .route("/bars/cache", get(get_cache_stats))
}
