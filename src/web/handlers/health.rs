use axum::{extract::State, http::StatusCode, response::Response, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::schedule::types::TaskStats;
use crate::utils::http::ApiResponse;
use crate::web::handlers::transcribe::task_error_response;
use crate::AppContext;

pub fn health_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .with_state(ctx)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub git_hash: String,
    pub engine: String,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub slots_in_use: usize,
    pub slots_total: usize,
    pub tasks: TaskStats,
}

async fn health_check(State(ctx): State<Arc<AppContext>>) -> Response {
    let stats = match ctx.task_manager.get_stats().await {
        Ok(stats) => stats,
        Err(e) => return task_error_response(&e),
    };
    let limiter = ctx.task_manager.limiter();

    let health = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or_default().to_string(),
        engine: ctx.task_manager.processor().name().to_string(),
        active_tasks: stats.processing,
        pending_tasks: stats.pending,
        slots_in_use: limiter.in_use(),
        slots_total: limiter.capacity(),
        tasks: stats,
    };
    ApiResponse::success(health).reply(StatusCode::OK)
}

async fn root() -> Response {
    ApiResponse::success(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
    .reply(StatusCode::OK)
}
