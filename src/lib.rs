use std::sync::Arc;

use axum::{Json, Router, routing::get};
use state::State;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, decompression::RequestDecompressionLayer,
};
use utoipa::OpenApi;

pub mod dedup;
pub mod donations;
pub mod entity;
pub mod error;
pub mod openapi;
pub mod replay_guard;
pub mod routes;
pub mod state;

pub use axum;
pub use sea_orm;

pub fn construct_router(state: Arc<State>) -> Router {
    Router::new()
        .nest("/health", routes::health::routes())
        .nest("/donations", routes::checkout::routes())
        .nest("/webhook", routes::webhook::routes())
        .route(
            "/openapi.json",
            get(|| async { Json(openapi::ApiDoc::openapi()) }),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            ServiceBuilder::new()
                .layer(RequestDecompressionLayer::new())
                .layer(CompressionLayer::new()),
        )
}
