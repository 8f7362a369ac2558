//! Router assembly: CORS, tracing, and every route bound to `AppState`.

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::routes;
use super::state::AppState;

pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit", post(routes::submit))
        .route("/status/:id", get(routes::status))
        .route("/results/:id", get(routes::results))
        .route("/cancel/:id", post(routes::cancel))
        .route("/jobs", get(routes::list_jobs))
        .route("/nodes", get(routes::nodes))
        .route("/dashboard", get(routes::dashboard))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(330)))
        .layer(cors)
        .with_state(state)
}
