//! HTTP API handlers and routing.

mod health;
pub mod nodes;

use axum::{http::header, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    // Anything unrouted is looked up in the public directory
    let public = ServeDir::new(state.public_dir());

    Router::new()
        .merge(health::routes())
        .nest("/api", nodes::routes())
        .fallback_service(public)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
