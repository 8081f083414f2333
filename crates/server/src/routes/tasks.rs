use axum::{
    extract::{Path, State},
    response::Json,
};
use db::models::task_state::TaskState;
use serde::Serialize;
use utils::channel_msg::ChannelMsg;

use crate::{error::ApiError, response::ApiResponse, state::AppState};

pub async fn get_task_state(
    State(app): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskState>>, ApiError> {
    let task = app.state.get_task(&task_id).await?.ok_or_else(|| ApiError::TaskNotFound(task_id))?;
    Ok(Json(ApiResponse::success(task)))
}

#[derive(Debug, Serialize)]
pub struct TaskHistoryBody {
    #[serde(flatten)]
    pub task: TaskState,
    pub logs: Vec<String>,
    pub final_diff: Option<String>,
}

pub async fn get_task_history(
    State(app): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<TaskHistoryBody>>, ApiError> {
    let task = app.state.get_task(&task_id).await?.ok_or_else(|| ApiError::TaskNotFound(task_id.clone()))?;

    let (logs, final_diff) = match app.state.channels().get(&task_id).await {
        Some(channel) => {
            let history = channel.get_history();
            let logs = history
                .iter()
                .filter_map(|msg| match msg {
                    ChannelMsg::Log { data, .. } => Some(data.clone()),
                    _ => None,
                })
                .collect();
            let final_diff = history.iter().rev().find_map(|msg| match msg {
                ChannelMsg::Diff { data, .. } => Some(data.clone()),
                _ => None,
            });
            (logs, final_diff)
        }
        None => (Vec::new(), None),
    };

    Ok(Json(ApiResponse::success(TaskHistoryBody { task, logs, final_diff })))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use db::{DBService, models::task_state::JobKind};
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
    async fn get_task_state_returns_not_found_for_unknown_task() {
        let app = test_app_state().await;
        let err = get_task_state(State(app), Path("nope".to_string())).await.unwrap_err();
        assert!(matches!(err, ApiError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn get_task_state_returns_the_created_task() {
        let app = test_app_state().await;
        let created = app.state.create_task("acme", "widgets", 1, "sonnet", JobKind::Issue).await.unwrap();

        let Json(body) = get_task_state(State(app), Path(created.task_id.clone())).await.unwrap();
        assert_eq!(body.into_data().task_id, created.task_id);
    }

    #[tokio::test]
    async fn get_task_history_folds_log_and_diff_frames() {
        let app = test_app_state().await;
        let created = app.state.create_task("acme", "widgets", 2, "sonnet", JobKind::Issue).await.unwrap();
        let channel = app.state.channel(&created.task_id).await;
        channel.push_log("cloning repo");
        channel.push_log("running subprocess");
        channel.push_diff("diff --git a/x b/x");

        let Json(body) = get_task_history(State(app), Path(created.task_id)).await.unwrap();
        let history = body.into_data();
        assert_eq!(history.logs, vec!["cloning repo", "running subprocess"]);
        assert_eq!(history.final_diff.as_deref(), Some("diff --git a/x b/x"));
    }
}
