use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod services;

use services::{ingestion::IngestQueue, storage::BlobStore};

#[derive(Clone)]
pub struct AppState {
    pub db: db::Database,
    pub config: config::Config,
    pub blobs: Arc<dyn BlobStore>,
    pub ingest: IngestQueue,
}

pub fn app(state: AppState) -> Router {
    // Build protected routes (require authentication)
    let protected_routes = Router::new()
        .nest("/projects", routes::projects::router())
        .nest("/buildings", routes::buildings::router())
        .nest("/issues", routes::issues::router())
        .nest("/storage", routes::storage::router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    // Upload and download URLs act as capabilities and carry no bearer token
    let api_router = Router::new()
        .nest("/blobs", routes::storage::blob_router(state.config.max_upload_bytes))
        .merge(protected_routes);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_router)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health_check() -> &'static str {
    "OK"
}
