use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub db: bool,
}

pub async fn health_check(State(app): State<AppState>) -> Json<HealthBody> {
    let db_ok = sqlx::query("SELECT 1").execute(&app.db.pool).await.is_ok();
    Json(HealthBody { status: if db_ok { "ok" } else { "degraded" }, db: db_ok })
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
    async fn reports_ok_when_db_reachable() {
        let app = test_app_state().await;
        let Json(body) = health_check(State(app)).await;
        assert_eq!(body.status, "ok");
        assert!(body.db);
    }
}
