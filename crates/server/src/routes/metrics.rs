use axum::{extract::State, response::Json};

use crate::{error::ApiError, response::ApiResponse, state::AppState};

pub async fn llm_metrics(
    State(app): State<AppState>,
) -> Result<Json<ApiResponse<state::LlmMetrics>>, ApiError> {
    let metrics = app.state.llm_metrics().await?;
    Ok(Json(ApiResponse::success(metrics)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use db::DBService;
    use queue::Queue;
    use state::StateStore;

    use super::*;

    async fn test_app_state() -> AppState {
        let dir = tempfile::tempdir().unwrap();
        let db = DBService::new(&DBService::default_database_url(&dir.path().to_path_buf())).await.unwrap();
        std::mem::forget(dir);
        let state = Arc::new(StateStore::new(db.clone(), 5.0, chrono::Duration::minutes(30)));
        let queue = Arc::new(Queue::new(db.clone()));
        AppState::new(db, state, queue)
    }

    #[tokio::test]
    async fn returns_empty_series_with_no_executions_recorded() {
        let app = test_app_state().await;
        let Json(body) = llm_metrics(State(app)).await.unwrap();
        let metrics = body.into_data();
        assert!(metrics.high_cost_alerts.is_empty());
    }
}
