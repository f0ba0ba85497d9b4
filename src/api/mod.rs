//! HTTP ingress (spec.md §6). Grounded in the teacher's axum `Router` /
//! `AppState` layout (`main.rs`, `api/routes.rs`).

pub mod routes;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::Db;
use crate::ids::IdGenerator;
use axum::{
    routing::{get, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub config: Arc<AppConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/receipts", axum::routing::post(routes::post_receipt))
        .route("/v1/receipts/:receipt_id/status", get(routes::get_receipt_status))
        .route("/v1/redeem", axum::routing::post(routes::post_redeem))
        .route("/v1/redeem/:redemption_id/status", get(routes::get_redeem_status))
        .route("/v1/accounts/:account_id/balances", get(routes::get_balances))
        .route(
            "/v1/programs/:program_id/config",
            put(routes::put_program_config).get(routes::get_program_config),
        )
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
