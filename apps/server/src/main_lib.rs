use std::sync::Arc;

use barvault_core::BarService;
use barvault_market_data::{
    BulkArchiveClient, Clock, LiveQueryClient, MarketType, RateLimiter, RestKlines, SystemClock,
    VisionArchive,
};
use barvault_storage_sqlite::{db, SqliteCacheStore};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub struct AppState {
    pub bar_service: Arc<BarService>,
    pub db_path: String,
}

pub fn init_tracing() {
    let log_format = std::env::var("BARVAULT_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }
}

/// Wires the SQLite cache, both remote sources and the shared rate limiter.
pub async fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let db_path = db::init(&config.db_path)?;
    tracing::info!("Database path in use: {}", db_path);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(SqliteCacheStore::open(&db_path)?.with_clock(clock.clone()));

    let bars = &config.bars;
    let limiter = Arc::new(RateLimiter::with_mode(clock.clone(), bars.limiter_mode));
    for market in MarketType::ALL {
        limiter.configure(market, bars.weight_budget(market));
    }

    let vision = match &bars.archive_base_url {
        Some(url) => VisionArchive::with_base_url(url.as_str()),
        None => VisionArchive::new(),
    };
    let archive = BulkArchiveClient::new(Arc::new(vision), clock.clone())
        .with_lag(bars.archive_lag)
        .with_retry(bars.archive_retry);
    let live = LiveQueryClient::new(Arc::new(RestKlines::new()), limiter);

    tracing::info!(
        lag_hours = bars.archive_lag.as_secs() / 3_600,
        strict = bars.strict,
        mode = ?bars.limiter_mode,
        "Bar service configured"
    );

    let bar_service = BarService::new(
        cache,
        Arc::new(archive),
        Arc::new(live),
        clock,
        bars.clone(),
    );

    Ok(Arc::new(AppState {
        bar_service: Arc::new(bar_service),
        db_path,
    }))
}
