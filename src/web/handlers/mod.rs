use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use crate::AppContext;

pub mod health;
pub mod transcribe;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .nest("/api/v1/transcribe", transcribe::transcribe_router(ctx.clone()))
        .merge(health::health_router(ctx))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
