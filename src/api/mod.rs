pub mod error;
pub mod v1;

use axum::{http::StatusCode, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{config::Config, controller::AppState};

/// Top-level router: an unauthenticated `/healthz` alongside the
/// bearer-token-protected `/api/v1` surface (spec.md §6).
pub fn router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", v1::router(state, cfg))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
