use axum::{
    Router,
    routing::{get, post},
};

use crate::state::AppState;

pub mod health;
pub mod import;
pub mod metrics;
pub mod tasks;
pub mod ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/task/{taskId}/state", get(tasks::get_task_state))
        .route("/task/{taskId}/history", get(tasks::get_task_history))
        .route("/ws/tasks/{taskId}", get(ws::task_stream))
        .route("/metrics/llm", get(metrics::llm_metrics))
        .route("/import-tasks", post(import::import_tasks))
        .with_state(state)
}
