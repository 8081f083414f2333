use std::sync::Arc;

use chrono::Duration;
use db::{
    DBService,
    models::{
        counters,
        idempotency,
        task_state::{ErrorInfo, JobKind, PrResultInfo, TaskState, TaskStateKind},
    },
};
use utils::msg_store::MsgStore;

use crate::{channels::ChannelRegistry, error::StateError};

/// Wraps the durable `tasks` table (survives restart - real crash recovery) and the in-process
/// pub/sub channels (best-effort streaming, evicted with the task) behind one API, so a worker
/// doesn't have to juggle `db` and `utils::msg_store` separately.
#[derive(Clone)]
pub struct StateStore {
    db: DBService,
    channels: ChannelRegistry,
    cost_threshold_usd: f64,
    stale_threshold: Duration,
}

impl StateStore {
    pub fn new(db: DBService, cost_threshold_usd: f64, stale_threshold: Duration) -> Self {
        Self { db, channels: ChannelRegistry::new(), cost_threshold_usd, stale_threshold }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub async fn channel(&self, task_id: &str) -> Arc<MsgStore> {
        self.channels.get_or_create(task_id).await
    }

    pub async fn create_task(
        &self,
        owner: &str,
        repo: &str,
        issue_number: i64,
        model: &str,
        kind: JobKind,
    ) -> Result<TaskState, StateError> {
        Ok(TaskState::create(&self.db.pool, owner, repo, issue_number, model, kind).await?)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskState>, StateError> {
        Ok(TaskState::get(&self.db.pool, task_id).await?)
    }

    pub async fn update_task(
        &self,
        task_id: &str,
        new_state: TaskStateKind,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StateError> {
        TaskState::update_state(&self.db.pool, task_id, new_state, reason, metadata).await?;
        if let Some(store) = self.channels.get(task_id).await {
            store.push_state(serde_json::json!({ "state": new_state.as_str(), "reason": reason }));
        }
        Ok(())
    }

    pub async fn update_history_metadata(
        &self,
        task_id: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StateError> {
        Ok(TaskState::update_history_metadata(&self.db.pool, task_id, metadata).await?)
    }

    pub async fn set_session(
        &self,
        task_id: &str,
        session_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<(), StateError> {
        Ok(TaskState::set_session(&self.db.pool, task_id, session_id, conversation_id).await?)
    }

    pub async fn set_container(
        &self,
        task_id: &str,
        container_id: &str,
        container_name: &str,
    ) -> Result<(), StateError> {
        Ok(TaskState::set_container(&self.db.pool, task_id, container_id, container_name).await?)
    }

    pub async fn mark_failed(&self, task_id: &str, error: ErrorInfo) -> Result<(), StateError> {
        TaskState::mark_failed(&self.db.pool, task_id, error).await?;
        if let Some(store) = self.channels.get(task_id).await {
            store.push_state(serde_json::json!({ "state": TaskStateKind::Failed.as_str() }));
            store.push_finished();
        }
        Ok(())
    }

    pub async fn mark_requeued(
        &self,
        task_id: &str,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<(), StateError> {
        TaskState::mark_requeued(&self.db.pool, task_id, reason, metadata).await?;
        if let Some(store) = self.channels.get(task_id).await {
            store.push_state(serde_json::json!({ "state": TaskStateKind::Requeued.as_str() }));
            store.push_finished();
        }
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        task_id: &str,
        terminal: TaskStateKind,
        pr_result: Option<PrResultInfo>,
    ) -> Result<(), StateError> {
        TaskState::mark_completed(&self.db.pool, task_id, terminal, pr_result).await?;
        if let Some(store) = self.channels.get(task_id).await {
            store.push_state(serde_json::json!({ "state": terminal.as_str() }));
            store.push_finished();
        }
        Ok(())
    }

    /// Non-terminal tasks left behind by a crashed worker, each flagged stale iff its
    /// `updated_at` predates the configured staleness window. Recovery policy belongs to the
    /// caller (the worker's resume sweep).
    pub async fn list_resumable(&self) -> Result<Vec<(TaskState, bool)>, StateError> {
        Ok(TaskState::list_resumable(&self.db.pool, self.stale_threshold).await?)
    }

    pub async fn get_resumable(
        &self,
        task_id: &str,
    ) -> Result<Option<(TaskState, bool)>, StateError> {
        Ok(TaskState::get_resumable(&self.db.pool, task_id, self.stale_threshold).await?)
    }

    pub async fn cleanup_old_tasks(&self, max_age: Duration) -> Result<u64, StateError> {
        let removed = TaskState::cleanup_old_tasks(&self.db.pool, max_age).await?;
        Ok(removed)
    }

    pub async fn record_execution(
        &self,
        task_id: &str,
        model: &str,
        success: bool,
        cost_usd: f64,
        turns: i64,
        execution_time_ms: i64,
    ) -> Result<(), StateError> {
        Ok(counters::record_execution(
            &self.db.pool,
            task_id,
            model,
            success,
            cost_usd,
            turns,
            execution_time_ms,
            self.cost_threshold_usd,
        )
        .await?)
    }

    /// Records an idempotency key the first time it's seen; `true` means this call was the
    /// first (the caller should proceed), `false` means a duplicate (skip).
    pub async fn mark_seen(&self, key: &str) -> Result<bool, StateError> {
        Ok(idempotency::mark_seen(&self.db.pool, key).await?)
    }

    pub async fn has_seen(&self, key: &str) -> Result<bool, StateError> {
        Ok(idempotency::has_seen(&self.db.pool, key).await?)
    }

    /// Aggregated counters backing `GET /metrics/llm`: per-model/day totals for the last 7 days
    /// plus the most recent high-cost alerts (capped at 100 by the underlying query).
    pub async fn llm_metrics(&self) -> Result<LlmMetrics, StateError> {
        let daily = counters::last_7_days_series(&self.db.pool).await?;
        let high_cost_alerts = counters::latest_high_cost_alerts(&self.db.pool, 100).await?;
        Ok(LlmMetrics { daily, high_cost_alerts })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LlmMetrics {
    pub daily: Vec<counters::DailyCounter>,
    pub high_cost_alerts: Vec<counters::HighCostAlert>,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> StateStore {
        let dir = tempfile::tempdir().unwrap();
        let url = DBService::default_database_url(&dir.path().to_path_buf());
        let db = DBService::new(&url).await.unwrap();
        std::mem::forget(dir);
        StateStore::new(db, 5.0, Duration::minutes(30))
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = test_store().await;
        let created = store.create_task("acme", "widgets", 42, "sonnet", JobKind::Issue).await.unwrap();
        let fetched = store.get_task(&created.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.state, TaskStateKind::Pending);
        assert_eq!(fetched.history.len(), 1);
    }

    #[tokio::test]
    async fn update_task_appends_history_and_pushes_state_channel() {
        let store = test_store().await;
        let created = store.create_task("acme", "widgets", 7, "sonnet", JobKind::Issue).await.unwrap();
        let channel = store.channel(&created.task_id).await;

        store
            .update_task(&created.task_id, TaskStateKind::Processing, "picked up", serde_json::Value::Null)
            .await
            .unwrap();

        let fetched = store.get_task(&created.task_id).await.unwrap().unwrap();
        assert_eq!(fetched.state, TaskStateKind::Processing);
        assert_eq!(fetched.history.len(), 2);
        assert_eq!(channel.get_history().len(), 1);
    }

    #[tokio::test]
    async fn mark_failed_pushes_finished_on_channel() {
        let store = test_store().await;
        let created = store.create_task("acme", "widgets", 9, "sonnet", JobKind::Issue).await.unwrap();
        let channel = store.channel(&created.task_id).await;

        store
            .mark_failed(
                &created.task_id,
                ErrorInfo {
                    category: "git".to_string(),
                    message: "boom".to_string(),
                    stage: "clone".to_string(),
                    branch: None,
                },
            )
            .await
            .unwrap();

        let history = channel.get_history();
        assert!(matches!(history.last(), Some(utils::channel_msg::ChannelMsg::Finished)));
    }

    #[tokio::test]
    async fn idempotency_key_seen_once() {
        let store = test_store().await;
        assert!(store.mark_seen("key-1").await.unwrap());
        assert!(!store.mark_seen("key-1").await.unwrap());
        assert!(store.has_seen("key-1").await.unwrap());
    }
}
