//! HTTP API for the presentation layer.

mod handlers;
mod state;

use axum::routing::{get, post};
use axum::Router;
use state::AppState;
use std::io;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::postal::PostalResolver;

pub fn build_router(resolver: Arc<PostalResolver>) -> Router {
    let state = Arc::new(AppState { resolver });

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/resolve", get(handlers::resolve))
        .route("/api/locations", post(handlers::locations))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start(resolver: Arc<PostalResolver>, host: &str, port: u16) -> io::Result<()> {
    let app = build_router(resolver);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Kampung Atlas API listening on http://{}", addr);

    axum::serve(listener, app).await
}
