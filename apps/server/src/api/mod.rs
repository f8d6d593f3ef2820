use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, main_lib::AppState};

mod bars;
mod health;

pub fn app_router(state: Arc<AppState>, config: &Config) -> Router {
    let api = Router::new().merge(bars::router()).merge(health::router());

    Router::new()
        .nest("/api/v1", api)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
